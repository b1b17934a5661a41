//! Tool permission profiles.
//!
//! Evaluates agent tool requests against an ordered rule list
//! (first match wins) with an explicit fallback action. The read-only
//! planning profile keeps planning agents from mutating a worktree before a
//! plan has been approved.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tools a planning agent may use: reading and searching only.
pub const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "WebFetch",
    "WebSearch",
    "NotebookRead",
    "TodoWrite",
];

/// Tools that write, edit or execute.
pub const MUTATING_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit", "Bash"];

/// Answer files a planning agent may write when it cannot reply in chat:
/// the plan, then the subtask list.
pub const PLANNING_ARTIFACT_FILES: [&str; 2] = [".taskforge-plan.json", ".taskforge-subtasks.json"];

/// Permission rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Tool name pattern (supports trailing glob: "Bash", "mcp__*", "*").
    pub tool_pattern: String,
    /// Action to take when matched.
    pub action: PermissionAction,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// When non-empty, the rule only matches requests whose `file_path`
    /// has one of these file names.
    #[serde(default)]
    pub file_names: Vec<String>,
}

impl PermissionRule {
    fn new(tool_pattern: &str, action: PermissionAction, description: &str) -> Self {
        Self {
            tool_pattern: tool_pattern.to_string(),
            action,
            description: Some(description.to_string()),
            file_names: Vec::new(),
        }
    }

    fn matches(&self, tool_name: &str, input: &Value) -> bool {
        if !matches_tool(&self.tool_pattern, tool_name) {
            return false;
        }
        if self.file_names.is_empty() {
            return true;
        }
        input
            .get("file_path")
            .and_then(Value::as_str)
            .and_then(plain_file_name)
            .is_some_and(|name| self.file_names.iter().any(|f| f == name))
    }
}

/// File name of a path with no `..` components.
fn plain_file_name(path: &str) -> Option<&str> {
    let path = Path::new(path);
    if path.components().any(|c| c == Component::ParentDir) {
        return None;
    }
    path.file_name()?.to_str()
}

/// Permission action to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    #[default]
    Deny,
}

/// Result of permission evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub action: PermissionAction,
    /// Reason for the decision, sent back to the agent on denial.
    pub reason: String,
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        self.action == PermissionAction::Allow
    }
}

/// Permission engine for evaluating tool requests.
#[derive(Debug, Clone)]
pub struct PermissionEngine {
    name: &'static str,
    rules: Vec<PermissionRule>,
    fallback: PermissionAction,
}

impl PermissionEngine {
    /// Read-only profile used during planning: explicit allow-list for
    /// read/search tools, explicit reject for write/edit/execute tools,
    /// reject everything else. `Write` is allowed for the planning answer
    /// files only.
    pub fn planning_read_only() -> Self {
        let artifacts = PermissionRule {
            file_names: PLANNING_ARTIFACT_FILES.iter().map(ToString::to_string).collect(),
            ..PermissionRule::new(
                "Write",
                PermissionAction::Allow,
                "Planning answer file allowed",
            )
        };
        let allow = READ_ONLY_TOOLS.iter().map(|tool| {
            PermissionRule::new(tool, PermissionAction::Allow, "Read-only tool allowed")
        });
        let deny = MUTATING_TOOLS.iter().map(|tool| {
            PermissionRule::new(
                tool,
                PermissionAction::Deny,
                "Planning is read-only until the plan is approved",
            )
        });
        Self {
            name: "planning-read-only",
            rules: std::iter::once(artifacts).chain(allow).chain(deny).collect(),
            fallback: PermissionAction::Deny,
        }
    }

    /// Profile used outside planning: everything is allowed.
    pub const fn permissive() -> Self {
        Self {
            name: "permissive",
            rules: Vec::new(),
            fallback: PermissionAction::Allow,
        }
    }

    /// Engine with custom rules and fallback.
    pub const fn with_rules(
        name: &'static str,
        rules: Vec<PermissionRule>,
        fallback: PermissionAction,
    ) -> Self {
        Self {
            name,
            rules,
            fallback,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Tools allowed outright (for `--allowedTools`-style flags). Rules
    /// scoped to file names are left to per-request evaluation.
    pub fn allowed_tools(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|r| r.action == PermissionAction::Allow && r.file_names.is_empty())
            .map(|r| r.tool_pattern.clone())
            .collect()
    }

    /// Tools denied outright. A tool with a file-scoped allow rule is
    /// omitted so its requests still reach [`Self::evaluate`].
    pub fn disallowed_tools(&self) -> Vec<String> {
        let scoped: Vec<&str> = self
            .rules
            .iter()
            .filter(|r| r.action == PermissionAction::Allow && !r.file_names.is_empty())
            .map(|r| r.tool_pattern.as_str())
            .collect();
        self.rules
            .iter()
            .filter(|r| r.action == PermissionAction::Deny && !scoped.contains(&r.tool_pattern.as_str()))
            .map(|r| r.tool_pattern.clone())
            .collect()
    }

    /// Evaluate a tool request against rules.
    pub fn evaluate(&self, tool_name: &str, input: &Value) -> PermissionDecision {
        for rule in &self.rules {
            if rule.matches(tool_name, input) {
                return PermissionDecision {
                    action: rule.action,
                    reason: rule
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("matched rule '{}'", rule.tool_pattern)),
                };
            }
        }
        PermissionDecision {
            action: self.fallback,
            reason: format!("{tool_name} is not permitted by the {} profile", self.name),
        }
    }
}

/// Check if a tool name matches a pattern.
fn matches_tool(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tool_name.starts_with(prefix);
    }
    pattern == tool_name
}
