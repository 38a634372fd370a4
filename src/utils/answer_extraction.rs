//! Robust JSON extraction from agent output.
//!
//! Agents are told to write a bare JSON value, but real output arrives
//! wrapped in markdown fences, prose, or trailing commentary. The
//! extraction strategies are tried in order:
//! 1. Direct parse of the whole content
//! 2. JSON inside a json-tagged markdown fence
//! 3. JSON inside a generic markdown fence
//! 4. First balanced object/array found by bracket matching

use regex::Regex;
use serde_json::Value;

/// Extracts the first parseable JSON value from mixed content.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    for block in fenced_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }

    if let Some(candidate) = balanced_span(trimmed) {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Some(value);
        }
    }

    None
}

/// Contents of markdown code fences, json-tagged first.
fn fenced_blocks(content: &str) -> Vec<&str> {
    let mut blocks = Vec::new();

    let json_fence = Regex::new(r"(?s)```json\s*\n(.*?)```").expect("valid regex");
    for capture in json_fence.captures_iter(content) {
        if let Some(m) = capture.get(1) {
            blocks.push(m.as_str());
        }
    }

    let any_fence = Regex::new(r"(?s)```\s*\n(.*?)```").expect("valid regex");
    for capture in any_fence.captures_iter(content) {
        if let Some(m) = capture.get(1) {
            blocks.push(m.as_str());
        }
    }

    blocks
}

/// First balanced `{...}` or `[...]` span, respecting string literals.
fn balanced_span(content: &str) -> Option<&str> {
    let start = content.find(['{', '['])?;
    let bytes = content.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_json() {
        assert_eq!(extract_json(r#"{"a": 1.5}"#), Some(json!({"a": 1.5})));
        assert_eq!(extract_json("3.25"), Some(json!(3.25)));
        assert_eq!(extract_json("[1, 2]"), Some(json!([1, 2])));
    }

    #[test]
    fn test_empty_content() {
        assert_eq!(extract_json(""), None);
        assert_eq!(extract_json("   \n"), None);
    }

    #[test]
    fn test_json_fence() {
        let content = "Here is my answer:\n```json\n{\"mass\": 5.9}\n```\nDone.";
        assert_eq!(extract_json(content), Some(json!({"mass": 5.9})));
    }

    #[test]
    fn test_generic_fence() {
        let content = "```\n{\"mass\": 5.9}\n```";
        assert_eq!(extract_json(content), Some(json!({"mass": 5.9})));
    }

    #[test]
    fn test_embedded_object() {
        let content = "The final result is {\"a\": 1.0, \"b\": [2.0, 3.0]} as computed.";
        assert_eq!(
            extract_json(content),
            Some(json!({"a": 1.0, "b": [2.0, 3.0]}))
        );
    }

    #[test]
    fn test_braces_inside_strings() {
        let content = r#"note {"label": "open { brace", "x": 1} trailing"#;
        assert_eq!(
            extract_json(content),
            Some(json!({"label": "open { brace", "x": 1}))
        );
    }

    #[test]
    fn test_no_json_present() {
        assert_eq!(extract_json("I could not compute the value."), None);
    }

    #[test]
    fn test_truncated_json_yields_none() {
        assert_eq!(extract_json(r#"{"a": [1, 2"#), None);
    }
}
