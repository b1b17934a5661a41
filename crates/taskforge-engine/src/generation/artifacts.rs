//! Generated artifacts: required-field extraction from agent output and
//! the well-known fallback files an agent may write instead.

use std::path::{Path, PathBuf};

use serde_json::Value;
use taskforge_core::json_recovery::{RecoveryError, recover_json};
use taskforge_core::permissions::PLANNING_ARTIFACT_FILES;
use taskforge_core::validation::{
    SubtaskSpec, ValidationResult, generate_plan_feedback, generate_subtask_feedback,
    parse_subtasks, validate_plan_markdown, validate_subtask_list,
};
use tracing::debug;

/// Fallback file for `{"plan": ...}`.
pub const PLAN_ARTIFACT_FILE: &str = PLANNING_ARTIFACT_FILES[0];
/// Fallback file for `{"subtasks": [...]}`.
pub const SUBTASKS_ARTIFACT_FILE: &str = PLANNING_ARTIFACT_FILES[1];

/// What a generation run is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Plan,
    Subtasks,
}

impl ArtifactKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Subtasks => "subtasks",
        }
    }

    /// JSON field that must be present.
    pub const fn field(self) -> &'static str {
        self.as_str()
    }

    pub const fn expected_shape(self) -> &'static str {
        match self {
            Self::Plan => r#"{"plan": "<markdown>"}"#,
            Self::Subtasks => {
                r#"{"subtasks": [{"id": "1", "title": "...", "description": "...", "dependsOn": []}]}"#
            }
        }
    }

    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Plan => PLAN_ARTIFACT_FILE,
            Self::Subtasks => SUBTASKS_ARTIFACT_FILE,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output that could not be turned into an artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("recovered JSON has no usable \"{field}\" field; expected {expected_shape}")]
    MissingField {
        field: &'static str,
        expected_shape: &'static str,
    },
}

/// A recovered artifact, not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Plan(String),
    Subtasks(Value),
}

impl Artifact {
    pub fn validate(&self) -> ValidationResult {
        match self {
            Self::Plan(markdown) => validate_plan_markdown(markdown),
            Self::Subtasks(value) => validate_subtask_list(value),
        }
    }

    /// Retry-prompt feedback for a failed validation.
    pub fn feedback(&self, result: &ValidationResult) -> String {
        match self {
            Self::Plan(_) => generate_plan_feedback(result),
            Self::Subtasks(_) => generate_subtask_feedback(result),
        }
    }

    pub fn subtasks(&self) -> Vec<SubtaskSpec> {
        match self {
            Self::Plan(_) => Vec::new(),
            Self::Subtasks(value) => parse_subtasks(value),
        }
    }
}

/// Recover `kind` from free-form agent output.
pub fn extract(kind: ArtifactKind, text: &str) -> Result<Artifact, ExtractError> {
    let recovered = recover_json(text, kind.expected_shape())?;
    from_value(kind, recovered.value)
}

fn from_value(kind: ArtifactKind, value: Value) -> Result<Artifact, ExtractError> {
    let missing = ExtractError::MissingField {
        field: kind.field(),
        expected_shape: kind.expected_shape(),
    };
    match kind {
        ArtifactKind::Plan => value
            .get("plan")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .map(|p| Artifact::Plan(p.to_string()))
            .ok_or(missing),
        ArtifactKind::Subtasks => {
            let has_list = value.is_array() || value.get("subtasks").is_some_and(Value::is_array);
            if has_list {
                Ok(Artifact::Subtasks(value))
            } else {
                Err(missing)
            }
        }
    }
}

/// Look for the fallback file in `working_dir`. Accepted only when it
/// recovers to JSON carrying the required field.
pub async fn scan_fallback(kind: ArtifactKind, working_dir: &Path) -> Option<(PathBuf, Artifact)> {
    let path = working_dir.join(kind.file_name());
    let text = tokio::fs::read_to_string(&path).await.ok()?;
    match extract(kind, &text) {
        Ok(artifact) => Some((path, artifact)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Fallback artifact unusable");
            None
        }
    }
}
