//! Git worktree isolation.
//!
//! Every task gets its own checkout and branch under the repository's
//! isolation root so concurrent agents never share a working tree.

mod manager;

pub use manager::{CleanupReport, Worktree, WorktreeError, WorktreeManager, sanitize_task_id};
