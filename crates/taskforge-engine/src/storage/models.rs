//! Task store models.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use taskforge_core::validation::SubtaskSpec;

/// A stored column value that names no known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Enum persisted as its snake_case name.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                match value.as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant { kind: stringify!($name), value }),
                }
            }
        }
    };
}

text_enum!(
    /// Workflow phase of a task.
    Phase {
        Planning => "planning",
        Development => "development",
        AiReview => "ai_review",
        HumanReview => "human_review",
        Done => "done",
    }
);

text_enum!(
    /// Execution status within the current phase.
    TaskStatus {
        Idle => "idle",
        Running => "running",
        Blocked => "blocked",
        Completed => "completed",
    }
);

text_enum!(
    /// Progress of plan and subtask generation.
    PlanningStatus {
        NotStarted => "not_started",
        GeneratingPlan => "generating_plan",
        AwaitingApproval => "awaiting_approval",
        GeneratingSubtasks => "generating_subtasks",
        Ready => "ready",
    }
);

/// Task record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[sqlx(try_from = "String")]
    pub phase: Phase,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    #[sqlx(try_from = "String")]
    pub planning_status: PlanningStatus,
    /// Requested backend; `None` uses the configured default.
    pub provider: Option<String>,
    pub working_dir: Option<String>,
    /// Thread of the most recent agent run.
    pub thread_id: Option<String>,
    pub plan: Option<String>,
    /// Accepted subtasks as a JSON array.
    pub subtasks: Option<String>,
    pub last_error: Option<String>,
    /// Plans wait for `approve` instead of flowing straight into subtasks.
    pub requires_human_review: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn working_dir_path(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(PathBuf::from)
    }

    /// Parsed subtasks; empty when none were stored.
    pub fn subtask_specs(&self) -> Vec<SubtaskSpec> {
        self.subtasks
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn set_subtasks(&mut self, subtasks: &[SubtaskSpec]) -> Result<(), serde_json::Error> {
        self.subtasks = Some(serde_json::to_string(subtasks)?);
        Ok(())
    }

    /// Needs a human: keeps the phase, records why.
    pub fn block(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Blocked;
        self.last_error = Some(message.into());
    }
}

/// Fields for [`super::TaskDatabase::create_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Generated when absent.
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub provider: Option<String>,
    pub requires_human_review: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip_through_strings() {
        for phase in [
            Phase::Planning,
            Phase::Development,
            Phase::AiReview,
            Phase::HumanReview,
            Phase::Done,
        ] {
            assert_eq!(Phase::try_from(phase.as_str().to_string()).unwrap(), phase);
        }
        let err = TaskStatus::try_from("paused".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "unknown TaskStatus value: paused");
        assert_eq!(PlanningStatus::AwaitingApproval.to_string(), "awaiting_approval");
    }
}
