//! Prompt builders for plan, subtask and development runs.

use std::fmt::Write as _;

use taskforge_core::validation::{REQUIRED_PLAN_SECTIONS, SubtaskSpec};

use super::artifacts::ArtifactKind;
use crate::adapter::{PLANNING_PROMPT_MARKER, is_planning_prompt};
use crate::storage::Task;

fn task_header(task: &Task) -> String {
    let mut out = format!("# Task: {}\n", task.title.trim());
    if !task.description.trim().is_empty() {
        out.push('\n');
        out.push_str(task.description.trim());
        out.push('\n');
    }
    out
}

fn answer_contract(kind: ArtifactKind) -> String {
    format!(
        "Respond with a single JSON object of the form {} and nothing else. \
         If you cannot answer in chat, write that object to `{}` in the working directory. \
         That is the only file you may create.",
        kind.expected_shape(),
        kind.file_name()
    )
}

/// Read-only planning prompt asking for `{"plan": "<markdown>"}`.
pub fn planning_prompt(task: &Task) -> String {
    let sections: Vec<String> = REQUIRED_PLAN_SECTIONS
        .iter()
        .map(|s| format!("## {s}"))
        .collect();
    format!(
        "{PLANNING_PROMPT_MARKER}\n\
         You are planning the implementation of a task. Explore the repository but do not modify project files.\n\n\
         {}\n\
         Write an implementation plan in markdown. It must start with a level-1 title and contain \
         the sections {}. \"## Implementation Steps\" must be a numbered list. \
         \"## Files\" and \"## Risks\" are recommended.\n\n\
         {}\n",
        task_header(task),
        sections.join(", "),
        answer_contract(ArtifactKind::Plan)
    )
}

/// Read-only prompt splitting an approved plan into subtasks.
pub fn subtask_prompt(task: &Task, plan: &str) -> String {
    format!(
        "{PLANNING_PROMPT_MARKER}\n\
         Break the approved plan below into small, independently reviewable subtasks. \
         Do not modify project files.\n\n\
         {}\n\
         ## Approved plan\n\n{}\n\n\
         Every subtask needs a unique \"id\", a short \"title\", a \"description\" of at least one \
         sentence and a \"dependsOn\" list of earlier subtask ids.\n\n\
         {}\n",
        task_header(task),
        plan.trim(),
        answer_contract(ArtifactKind::Subtasks)
    )
}

/// Implementation prompt carrying the plan and accepted subtasks.
pub fn development_prompt(task: &Task, plan: &str, subtasks: &[SubtaskSpec]) -> String {
    let mut out = format!(
        "Implement the task below in this working directory, following the approved plan.\n\n{}\n\
         ## Approved plan\n\n{}\n",
        task_header(task),
        plan.trim()
    );
    if !subtasks.is_empty() {
        out.push_str("\n## Subtasks\n\n");
        for subtask in subtasks {
            let _ = write!(out, "{}. {}: {}", subtask.id, subtask.title, subtask.description);
            if !subtask.depends_on.is_empty() {
                let _ = write!(out, " (after {})", subtask.depends_on.join(", "));
            }
            out.push('\n');
        }
    }
    out.push_str("\nCommit nothing; leave the changes in the working tree for review.\n");
    out
}

/// Re-prompt after an unusable answer. Carries the literal error and the
/// previous output verbatim; keeps the planning marker first.
pub fn corrective_prompt(
    original: &str,
    error: &str,
    previous_output: &str,
    feedback: Option<&str>,
) -> String {
    let planning = is_planning_prompt(original);
    let body = if planning {
        original
            .trim_start()
            .strip_prefix(PLANNING_PROMPT_MARKER)
            .unwrap_or(original)
            .trim_start()
    } else {
        original
    };

    let mut out = String::new();
    if planning {
        out.push_str(PLANNING_PROMPT_MARKER);
        out.push('\n');
    }
    out.push_str("Your previous answer could not be used.\n\nError:\n");
    out.push_str(error.trim());
    out.push_str("\n\nYour previous output, verbatim:\n<<<\n");
    out.push_str(previous_output);
    out.push_str("\n>>>\n");
    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        out.push('\n');
        out.push_str(feedback.trim());
        out.push('\n');
    }
    out.push_str("\nAnswer the original request again.\n\n---\n\n");
    out.push_str(body);
    out
}
