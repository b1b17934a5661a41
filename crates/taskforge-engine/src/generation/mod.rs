//! Plan and subtask generation.
//!
//! Agents answer in free text; the orchestrator recovers the JSON artifact,
//! validates it, and re-prompts with corrective feedback a bounded number
//! of times before blocking the task.

pub mod artifacts;
mod orchestrator;
pub mod prompts;

pub use artifacts::{Artifact, ArtifactKind, ExtractError};
pub use orchestrator::{DevelopmentRun, Orchestrator, OrchestratorError, Planned};
