//! Plan markdown validation.
//!
//! Headings are only recognised outside fenced code blocks. Section names
//! match case-insensitively on the start of the heading text, so
//! `## Implementation Steps (draft)` still counts.

use super::{ValidationResult, render_section};

/// `##` sections every plan must carry.
pub const REQUIRED_PLAN_SECTIONS: &[&str] =
    &["Overview", "Implementation Steps", "Acceptance Criteria"];

const RECOMMENDED_SECTIONS: &[&str] = &["Risks", "Files"];
const MIN_PLAN_CHARS: usize = 200;

#[derive(Debug)]
struct Section<'a> {
    title: &'a str,
    body: Vec<&'a str>,
}

struct Outline<'a> {
    h1: Option<&'a str>,
    sections: Vec<Section<'a>>,
    unclosed_fence: bool,
}

fn outline(markdown: &str) -> Outline<'_> {
    let mut h1 = None;
    let mut sections: Vec<Section<'_>> = Vec::new();
    let mut in_fence = false;

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            if let Some(section) = sections.last_mut() {
                section.body.push(line);
            }
            continue;
        }
        if !in_fence {
            if let Some(title) = trimmed.strip_prefix("# ") {
                h1.get_or_insert(title.trim());
                continue;
            }
            if let Some(title) = trimmed.strip_prefix("## ") {
                sections.push(Section {
                    title: title.trim(),
                    body: Vec::new(),
                });
                continue;
            }
        }
        if let Some(section) = sections.last_mut() {
            section.body.push(line);
        }
    }

    Outline {
        h1,
        sections,
        unclosed_fence: in_fence,
    }
}

fn heading_matches(title: &str, wanted: &str) -> bool {
    title
        .get(..wanted.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(wanted))
}

fn is_list_item(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") {
        return true;
    }
    let digits = t.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && (t[digits..].starts_with(". ") || t[digits..].starts_with(") "))
}

/// Validate a generated implementation plan.
pub fn validate_plan_markdown(markdown: &str) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if markdown.trim().is_empty() {
        errors.push("Plan is empty".to_string());
        return ValidationResult::from_findings(errors, warnings);
    }

    let outline = outline(markdown);

    if outline.h1.is_none_or(str::is_empty) {
        errors.push("Plan must start with a level-1 title (\"# ...\")".to_string());
    }
    if outline.unclosed_fence {
        errors.push("Plan contains an unclosed code fence".to_string());
    }

    for wanted in REQUIRED_PLAN_SECTIONS {
        let Some(section) = outline
            .sections
            .iter()
            .find(|s| heading_matches(s.title, wanted))
        else {
            errors.push(format!("Missing required section \"## {wanted}\""));
            continue;
        };
        if section.body.iter().all(|l| l.trim().is_empty()) {
            errors.push(format!("Section \"## {wanted}\" is empty"));
        } else if *wanted == "Implementation Steps" && !section.body.iter().any(|l| is_list_item(l))
        {
            errors.push(
                "\"## Implementation Steps\" must list the steps as a numbered or bulleted list"
                    .to_string(),
            );
        }
    }

    for wanted in RECOMMENDED_SECTIONS {
        if !outline
            .sections
            .iter()
            .any(|s| heading_matches(s.title, wanted))
        {
            warnings.push(format!("Consider adding a \"## {wanted}\" section"));
        }
    }

    if markdown.trim().chars().count() < MIN_PLAN_CHARS {
        warnings.push("Plan is very short; add enough detail to implement from".to_string());
    }

    ValidationResult::from_findings(errors, warnings)
}

/// Feedback appended to a corrective planning prompt.
pub fn generate_plan_feedback(result: &ValidationResult) -> String {
    if result.valid && result.warnings.is_empty() {
        return String::new();
    }
    let mut out = String::from("The plan you returned did not pass validation.\n");
    render_section(&mut out, "Errors:", &result.errors);
    render_section(&mut out, "Warnings:", &result.warnings);
    out.push_str("The plan must be markdown with a \"# Title\" and these sections: ");
    let sections: Vec<String> = REQUIRED_PLAN_SECTIONS
        .iter()
        .map(|s| format!("## {s}"))
        .collect();
    out.push_str(&sections.join(", "));
    out.push_str(". Return it as {\"plan\": \"<markdown>\"}.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_PLAN: &str = "# Add rate limiting\n\n\
        ## Overview\nLimit requests per client to protect the API from bursts.\n\n\
        ## Files\n- src/limiter.rs\n\n\
        ## Implementation Steps\n1. Add a token bucket.\n2. Wire it into the router.\n\n\
        ## Acceptance Criteria\n- Excess requests get 429.\n\n\
        ## Risks\n- Clock skew between replicas.\n";

    #[test]
    fn complete_plan_is_valid_without_warnings() {
        let result = validate_plan_markdown(GOOD_PLAN);
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn empty_plan_is_invalid() {
        assert!(!validate_plan_markdown("  \n").valid);
    }

    #[test]
    fn missing_sections_are_errors() {
        let result = validate_plan_markdown("# Title\n\n## Overview\nSomething.\n");
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("Implementation Steps")));
        assert!(result.errors.iter().any(|e| e.contains("Acceptance Criteria")));
    }

    #[test]
    fn steps_must_be_a_list() {
        let plan = GOOD_PLAN.replace(
            "1. Add a token bucket.\n2. Wire it into the router.",
            "Add a token bucket and wire it in.",
        );
        let result = validate_plan_markdown(&plan);
        assert!(!result.valid);
        assert!(result.errors[0].contains("list"));
    }

    #[test]
    fn headings_inside_fences_do_not_count() {
        let plan = "# T\n\n## Overview\nx\n```\n## Implementation Steps\n- a\n## Acceptance Criteria\n- b\n```\n";
        let result = validate_plan_markdown(plan);
        assert!(result.errors.iter().any(|e| e.contains("Implementation Steps")));
    }

    #[test]
    fn unclosed_fence_is_an_error() {
        let plan = format!("{GOOD_PLAN}\n```rust\nfn main() {{}}\n");
        let result = validate_plan_markdown(&plan);
        assert!(result.errors.iter().any(|e| e.contains("unclosed")));
    }

    #[test]
    fn heading_match_is_case_insensitive_prefix() {
        let plan = GOOD_PLAN.replace("## Implementation Steps", "## implementation steps (draft)");
        assert!(validate_plan_markdown(&plan).valid);
    }

    #[test]
    fn feedback_names_required_sections() {
        let result = validate_plan_markdown("no title");
        let feedback = generate_plan_feedback(&result);
        assert!(feedback.contains("## Acceptance Criteria"));
        assert!(feedback.contains("level-1 title"));
    }
}
