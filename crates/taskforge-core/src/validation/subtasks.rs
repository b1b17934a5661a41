//! Subtask list validation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ValidationResult, render_section};

/// More subtasks than this is allowed but flagged.
pub const MAX_RECOMMENDED_SUBTASKS: usize = 20;
const MAX_TITLE_CHARS: usize = 120;
const MIN_DESCRIPTION_CHARS: usize = 20;

/// One accepted subtask, normalized from the agent's JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: Vec<String>,
}

/// Locate the subtask array: `{"subtasks": [...]}` or a bare array.
fn subtask_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("subtasks").and_then(Value::as_array),
        _ => None,
    }
}

/// Ids are strings or integers; a missing id defaults to the 1-based position.
fn item_id(item: &Value, index: usize) -> Option<String> {
    match item.get("id") {
        None | Some(Value::Null) => Some((index + 1).to_string()),
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(_) => None,
    }
}

/// `None` when `dependsOn` is present but not an array of ids.
fn dependency_ids(item: &Value) -> Option<Vec<String>> {
    let Some(raw) = item.get("dependsOn").or_else(|| item.get("depends_on")) else {
        return Some(Vec::new());
    };
    match raw {
        Value::Null => Some(Vec::new()),
        Value::Array(deps) => deps
            .iter()
            .map(|d| match d {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn non_empty_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Validate a generated subtask list.
pub fn validate_subtask_list(value: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(items) = subtask_array(value) else {
        errors.push(
            "Expected an object with a \"subtasks\" array (or a bare array of subtasks)"
                .to_string(),
        );
        return ValidationResult::from_findings(errors, warnings);
    };

    if items.is_empty() {
        errors.push("Subtask list is empty".to_string());
        return ValidationResult::from_findings(errors, warnings);
    }
    if items.len() > MAX_RECOMMENDED_SUBTASKS {
        warnings.push(format!(
            "{} subtasks is a lot; consider merging to at most {MAX_RECOMMENDED_SUBTASKS}",
            items.len()
        ));
    }

    let mut ids: Vec<Option<String>> = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for (index, item) in items.iter().enumerate() {
        let n = index + 1;
        if !item.is_object() {
            errors.push(format!("Subtask {n} is not an object"));
            ids.push(None);
            continue;
        }

        let id = item_id(item, index);
        match &id {
            None => errors.push(format!("Subtask {n} has an invalid \"id\" (use a string)")),
            Some(id) if !seen.insert(id.clone()) => {
                errors.push(format!("Duplicate subtask id \"{id}\""));
            }
            Some(_) => {}
        }
        ids.push(id);

        match non_empty_str(item, "title") {
            None => errors.push(format!("Subtask {n} is missing a non-empty \"title\"")),
            Some(title) if title.chars().count() > MAX_TITLE_CHARS => warnings.push(format!(
                "Subtask {n} title is longer than {MAX_TITLE_CHARS} characters"
            )),
            Some(_) => {}
        }

        match non_empty_str(item, "description") {
            None => errors.push(format!("Subtask {n} is missing a non-empty \"description\"")),
            Some(desc) if desc.chars().count() < MIN_DESCRIPTION_CHARS => warnings.push(format!(
                "Subtask {n} description is very short; describe what done looks like"
            )),
            Some(_) => {}
        }
    }

    let mut graph: HashMap<&str, Vec<String>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let Some(Some(id)) = ids.get(index) else {
            continue;
        };
        let Some(deps) = dependency_ids(item) else {
            errors.push(format!(
                "Subtask \"{id}\" has an invalid \"dependsOn\" (use an array of ids)"
            ));
            continue;
        };
        for dep in &deps {
            if dep == id {
                errors.push(format!("Subtask \"{id}\" depends on itself"));
            } else if !seen.contains(dep) {
                errors.push(format!("Subtask \"{id}\" depends on unknown subtask \"{dep}\""));
            }
        }
        graph.insert(id.as_str(), deps);
    }

    if let Some(cycle_at) = find_cycle(&graph) {
        errors.push(format!("Dependency cycle involving subtask \"{cycle_at}\""));
    }

    ValidationResult::from_findings(errors, warnings)
}

/// Depth-first search for a cycle (self-loops are reported separately).
fn find_cycle<'a>(graph: &HashMap<&'a str, Vec<String>>) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if dep == node {
                    continue;
                }
                if let Some((key, _)) = graph.get_key_value(dep.as_str()) {
                    if let Some(found) = visit(*key, graph, marks) {
                        return Some(found);
                    }
                }
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut nodes: Vec<&&str> = graph.keys().collect();
    nodes.sort();
    for node in nodes {
        if let Some(found) = visit(*node, graph, &mut marks) {
            return Some(found);
        }
    }
    None
}

/// Normalize a list that passed [`validate_subtask_list`].
///
/// Items that would have failed validation are skipped.
pub fn parse_subtasks(value: &Value) -> Vec<SubtaskSpec> {
    let Some(items) = subtask_array(value) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            Some(SubtaskSpec {
                id: item_id(item, index)?,
                title: non_empty_str(item, "title")?.to_string(),
                description: non_empty_str(item, "description")?.to_string(),
                depends_on: dependency_ids(item)?,
            })
        })
        .collect()
}

/// Feedback appended to a corrective subtask prompt.
pub fn generate_subtask_feedback(result: &ValidationResult) -> String {
    if result.valid && result.warnings.is_empty() {
        return String::new();
    }
    let mut out = String::from("The subtask list you returned did not pass validation.\n");
    render_section(&mut out, "Errors:", &result.errors);
    render_section(&mut out, "Warnings:", &result.warnings);
    out.push_str(
        "Return a JSON object of the form {\"subtasks\": [{\"id\": \"1\", \"title\": \"...\", \
         \"description\": \"...\", \"dependsOn\": []}]} and nothing else.",
    );
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, deps: &[&str]) -> Value {
        json!({
            "id": id,
            "title": format!("Subtask {id}"),
            "description": "Implement the piece of work described by this subtask.",
            "dependsOn": deps,
        })
    }

    #[test]
    fn accepts_wrapped_and_bare_lists() {
        let list = vec![item("1", &[]), item("2", &["1"])];
        assert!(validate_subtask_list(&json!({ "subtasks": list.clone() })).valid);
        assert!(validate_subtask_list(&Value::Array(list)).valid);
    }

    #[test]
    fn rejects_wrong_shape_and_empty_list() {
        assert!(!validate_subtask_list(&json!({ "plan": "x" })).valid);
        let empty = validate_subtask_list(&json!({ "subtasks": [] }));
        assert!(!empty.valid);
        assert!(empty.errors[0].contains("empty"));
    }

    #[test]
    fn missing_title_and_description_are_errors() {
        let result = validate_subtask_list(&json!([{ "id": "1", "title": "  " }]));
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn dependency_problems_are_reported() {
        let result = validate_subtask_list(&json!([
            item("a", &["a"]),
            item("b", &["missing"]),
            item("b", &[]),
        ]));
        let joined = result.errors.join("\n");
        assert!(joined.contains("depends on itself"));
        assert!(joined.contains("unknown subtask \"missing\""));
        assert!(joined.contains("Duplicate subtask id \"b\""));
    }

    #[test]
    fn cycles_are_errors() {
        let result = validate_subtask_list(&json!([item("1", &["2"]), item("2", &["1"])]));
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn numeric_and_missing_ids_are_normalized() {
        let value = json!([
            { "id": 7, "title": "A", "description": "A long enough description here." },
            { "title": "B", "description": "Another long enough description.", "dependsOn": [7] },
        ]);
        assert!(validate_subtask_list(&value).valid);
        let parsed = parse_subtasks(&value);
        assert_eq!(parsed[0].id, "7");
        assert_eq!(parsed[1].id, "2");
        assert_eq!(parsed[1].depends_on, vec!["7"]);
    }

    #[test]
    fn long_lists_and_terse_items_only_warn() {
        let list: Vec<Value> = (1..=25)
            .map(|i| json!({ "id": i.to_string(), "title": "T", "description": "short" }))
            .collect();
        let result = validate_subtask_list(&Value::Array(list));
        assert!(result.valid);
        assert!(result.warnings.len() > 1);
    }

    #[test]
    fn feedback_lists_errors_and_expected_shape() {
        let result = validate_subtask_list(&json!([{ "id": "1" }]));
        let feedback = generate_subtask_feedback(&result);
        assert!(feedback.contains("Errors:"));
        assert!(feedback.contains("\"subtasks\""));
        assert!(generate_subtask_feedback(&ValidationResult::from_findings(vec![], vec![])).is_empty());
    }
}
