//! Structural validators for generated artifacts.
//!
//! Both validators are pure functions producing a [`ValidationResult`]. The
//! matching `*_feedback` renderers turn a failed result into the text that is
//! appended to a corrective prompt.

mod plan;
mod subtasks;

use serde::{Deserialize, Serialize};

pub use plan::{REQUIRED_PLAN_SECTIONS, generate_plan_feedback, validate_plan_markdown};
pub use subtasks::{
    MAX_RECOMMENDED_SUBTASKS, SubtaskSpec, generate_subtask_feedback, parse_subtasks,
    validate_subtask_list,
};

/// Outcome of a structural validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Build a result; `valid` is derived from the error list.
    pub fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Render a bullet list of findings under a heading, or nothing.
fn render_section(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push('\n');
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}
