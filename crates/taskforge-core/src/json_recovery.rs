//! JSON recovery from noisy agent output.
//!
//! Agents are asked for one JSON value but answer with prose, markdown
//! fences, or a broken first attempt followed by a corrected one. Recovery
//! returns the *first* candidate that actually parses:
//!
//! 1. fenced code blocks tagged `json` (or untagged), in order;
//! 2. every `{` / `[` position in the raw text, in order.
//!
//! For each candidate start the shortest balanced substring is extracted with
//! a quote-aware scanner (brackets inside string literals do not count) and
//! handed to `serde_json`. Nothing is ever returned that did not round-trip
//! through the parser.

use serde_json::Value;

/// Shape description used when the caller does not supply one.
pub const DEFAULT_EXPECTED_SHAPE: &str = "a single JSON object or array";

/// Where a recovered value was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// Inside the n-th fenced code block (0-based).
    Fenced { block: usize },
    /// Directly in the text, starting at this byte offset.
    Inline { offset: usize },
}

/// A successfully recovered JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub value: Value,
    pub source: RecoverySource,
    /// The exact substring that was parsed.
    pub raw: String,
}

/// Recovery failure. Carries the expected shape so the caller can put it in
/// a corrective prompt verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    #[error("output is empty; expected {expected_shape}")]
    Empty { expected_shape: String },

    #[error("no JSON found in output{}; expected {expected_shape}", parse_error_suffix(.parse_error))]
    NotFound {
        expected_shape: String,
        /// Parser error for the first balanced candidate, if there was one.
        parse_error: Option<String>,
    },
}

fn parse_error_suffix(parse_error: &Option<String>) -> String {
    parse_error
        .as_ref()
        .map(|e| format!(" (first candidate failed: {e})"))
        .unwrap_or_default()
}

impl RecoveryError {
    pub fn expected_shape(&self) -> &str {
        match self {
            Self::Empty { expected_shape } | Self::NotFound { expected_shape, .. } => {
                expected_shape
            }
        }
    }
}

/// Recover the first parseable JSON value from `text`.
pub fn recover(text: &str) -> Result<Value, RecoveryError> {
    recover_json(text, DEFAULT_EXPECTED_SHAPE).map(|r| r.value)
}

/// Recover the first parseable JSON value, reporting `expected_shape` on failure.
pub fn recover_json(text: &str, expected_shape: &str) -> Result<Recovered, RecoveryError> {
    if text.trim().is_empty() {
        return Err(RecoveryError::Empty {
            expected_shape: expected_shape.to_string(),
        });
    }

    let mut first_error: Option<String> = None;

    for (block, body) in fenced_blocks(text).into_iter().enumerate() {
        if let Some((_, raw, value)) = scan_candidates(body, &mut first_error) {
            return Ok(Recovered {
                value,
                source: RecoverySource::Fenced { block },
                raw: raw.to_string(),
            });
        }
    }

    if let Some((offset, raw, value)) = scan_candidates(text, &mut first_error) {
        return Ok(Recovered {
            value,
            source: RecoverySource::Inline { offset },
            raw: raw.to_string(),
        });
    }

    Err(RecoveryError::NotFound {
        expected_shape: expected_shape.to_string(),
        parse_error: first_error,
    })
}

/// Try every `{`/`[` in `text` in order; return the first balanced candidate
/// that parses. Records the first parse error seen into `first_error`.
fn scan_candidates<'a>(
    text: &'a str,
    first_error: &mut Option<String>,
) -> Option<(usize, &'a str, Value)> {
    for (offset, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let Some(candidate) = balanced_slice(text, offset) else {
            continue;
        };
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => return Some((offset, candidate, value)),
            Err(e) => {
                if first_error.is_none() {
                    *first_error = Some(e.to_string());
                }
            }
        }
    }
    None
}

/// Extract the shortest bracket-balanced substring starting at `start`.
///
/// `text[start..]` must begin with `{` or `[`. Brackets inside string literals
/// are ignored; escapes inside strings are honoured. Returns `None` when the
/// text ends before balance is reached or a closing bracket does not match
/// its opener.
pub fn balanced_slice(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if !matches!(bytes.get(start), Some(b'{' | b'[')) {
        return None;
    }

    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    // Brackets are ASCII, so i + 1 is a char boundary.
                    return text.get(start..=i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Bodies of fenced code blocks whose info string is empty or names JSON.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_ticks = &rest[open + 3..];
        let Some(newline) = after_ticks.find('\n') else {
            break;
        };
        let info = after_ticks[..newline].trim().to_ascii_lowercase();
        let body_start = &after_ticks[newline + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        if info.is_empty() || info == "json" || info == "jsonc" || info == "json5" {
            blocks.push(&body_start[..close]);
        }
        rest = &body_start[close + 3..];
    }

    blocks
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_balanced_match_wins() {
        let value = recover(r#"prefix noise {"a":1} trailing {"a":2}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn fenced_block_is_recovered() {
        let value = recover("```json\n{\"a\":1}\n```").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn no_json_is_not_found_not_a_panic() {
        let err = recover("no json here").unwrap_err();
        assert!(matches!(err, RecoveryError::NotFound { .. }));
        assert_eq!(err.expected_shape(), DEFAULT_EXPECTED_SHAPE);
    }

    #[test]
    fn brace_inside_string_does_not_end_balancing() {
        let value = recover(r#"{"a": "contains } brace"}"#).unwrap();
        assert_eq!(value, json!({"a": "contains } brace"}));
    }

    #[test]
    fn escaped_quote_inside_string() {
        let value = recover(r#"say {"q": "he said \"}\" loudly"} ok"#).unwrap();
        assert_eq!(value["q"], "he said \"}\" loudly");
    }

    #[test]
    fn malformed_first_attempt_is_skipped() {
        let text = r#"Attempt: {"a": 1,} Fixed: {"a": 2}"#;
        let recovered = recover_json(text, "object").unwrap();
        assert_eq!(recovered.value, json!({"a": 2}));
        assert!(matches!(recovered.source, RecoverySource::Inline { .. }));
    }

    #[test]
    fn fenced_blocks_take_priority_over_inline() {
        let text = "inline {\"a\":0}\n```json\n{\"a\":1}\n```";
        let recovered = recover_json(text, "object").unwrap();
        assert_eq!(recovered.value, json!({"a": 1}));
        assert_eq!(recovered.source, RecoverySource::Fenced { block: 0 });
    }

    #[test]
    fn non_json_fences_are_ignored() {
        let text = "```rust\nfn main() { println!(\"hi\"); }\n```\n{\"ok\":true}";
        assert_eq!(recover(text).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn broken_fence_falls_back_to_inline_scan() {
        let text = "```json\n{\"a\": oops}\n```\nthen {\"b\":2}";
        assert_eq!(recover(text).unwrap(), json!({"b": 2}));
    }

    #[test]
    fn arrays_are_recovered() {
        assert_eq!(recover("list: [1, 2, 3].").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn unbalanced_text_reports_parse_error() {
        let err = recover_json(r#"{"a": [1, 2}"#, "object").unwrap_err();
        match err {
            RecoveryError::NotFound { parse_error, .. } => {
                // The inner array candidate is unbalanced too, so nothing was parsed.
                assert!(parse_error.is_none());
            }
            RecoveryError::Empty { .. } => unreachable!(),
        }
    }

    #[test]
    fn parse_error_of_first_candidate_is_kept() {
        let err = recover_json("{not json}", "object").unwrap_err();
        let RecoveryError::NotFound { parse_error, .. } = err else {
            unreachable!()
        };
        assert!(parse_error.is_some());
    }

    #[test]
    fn empty_output_is_reported_as_empty() {
        assert!(matches!(
            recover_json("   \n", "object"),
            Err(RecoveryError::Empty { .. })
        ));
    }

    #[test]
    fn balanced_slice_handles_nesting() {
        let text = r#"x {"a": {"b": [1, {"c": "]"}]}} y"#;
        let start = text.find('{').unwrap();
        assert_eq!(
            balanced_slice(text, start).unwrap(),
            r#"{"a": {"b": [1, {"c": "]"}]}}"#
        );
    }

    #[test]
    fn balanced_slice_rejects_mismatched_closers() {
        assert!(balanced_slice("{]", 0).is_none());
        assert!(balanced_slice("not a start", 0).is_none());
    }

    #[test]
    fn multibyte_text_around_json() {
        let value = recover("résumé → {\"ü\": \"ß\"} ✓").unwrap();
        assert_eq!(value, json!({"ü": "ß"}));
    }
}
