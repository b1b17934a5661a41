//! TaskForge Engine Library
//!
//! Runtime for orchestrating coding agents:
//! - CLI adapters for the simulator, Claude and Codex backends
//! - Bounded agent pools and the registry that routes tasks to them
//! - Git worktree isolation per task
//! - SQLite task store and per-task audit log
//! - Plan/subtask generation with validation and bounded retries

pub mod adapter;
pub mod agent;
pub mod audit;
pub mod generation;
pub mod storage;
pub mod worktree;
