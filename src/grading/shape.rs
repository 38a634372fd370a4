//! Structural shape rules for expected outputs and tolerances.
//!
//! The same shape walk backs two checks: the load-time validation that a
//! task's `tolerance` mirrors its `expected_output`, and the grading-time
//! comparison of an agent answer against the expected structure.

use serde_json::Value;

/// Type category of a JSON value for shape comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// Number, string, bool, or null.
    Scalar,
    /// Ordered sequence (JSON array).
    Sequence,
    /// Key-value mapping (JSON object).
    Mapping,
}

impl std::fmt::Display for ValueShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueShape::Scalar => write!(f, "scalar"),
            ValueShape::Sequence => write!(f, "sequence"),
            ValueShape::Mapping => write!(f, "mapping"),
        }
    }
}

/// Returns the type category of a JSON value.
pub fn shape_of(value: &Value) -> ValueShape {
    match value {
        Value::Array(_) => ValueShape::Sequence,
        Value::Object(_) => ValueShape::Mapping,
        _ => ValueShape::Scalar,
    }
}

/// Extends a structural path with a mapping key.
pub fn key_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Extends a structural path with a sequence index.
pub fn index_path(path: &str, index: usize) -> String {
    format!("{path}[{index}]")
}

/// Counts the scalar leaves of a value.
pub fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.iter().map(leaf_count).sum(),
        Value::Object(map) => map.values().map(leaf_count).sum(),
        _ => 1,
    }
}

/// Checks that `tolerance` mirrors the shape of `expected` exactly.
///
/// Composites must match in category, length, and keys at every level.
/// Numeric leaves require a non-negative numeric tolerance; non-numeric
/// leaves (strings, bools) are compared for exact equality at grading
/// time, so their tolerance slot may hold any scalar (null included).
///
/// On violation returns a human-readable reason naming the offending
/// path, e.g. `"b[1]: expected numeric tolerance, found string"`.
pub fn tolerance_mirrors(expected: &Value, tolerance: &Value) -> Result<(), String> {
    mirrors_at(expected, tolerance, "")
}

fn mirrors_at(expected: &Value, tolerance: &Value, path: &str) -> Result<(), String> {
    let here = if path.is_empty() { "<root>" } else { path };

    match (expected, tolerance) {
        (Value::Array(exp), Value::Array(tol)) => {
            if exp.len() != tol.len() {
                return Err(format!(
                    "{here}: sequence length {} vs tolerance length {}",
                    exp.len(),
                    tol.len()
                ));
            }
            for (idx, (e, t)) in exp.iter().zip(tol.iter()).enumerate() {
                mirrors_at(e, t, &index_path(path, idx))?;
            }
            Ok(())
        }
        (Value::Object(exp), Value::Object(tol)) => {
            for key in exp.keys() {
                if !tol.contains_key(key) {
                    return Err(format!("{here}: tolerance missing key '{key}'"));
                }
            }
            for key in tol.keys() {
                if !exp.contains_key(key) {
                    return Err(format!("{here}: tolerance has extra key '{key}'"));
                }
            }
            for (key, e) in exp {
                mirrors_at(e, &tol[key], &key_path(path, key))?;
            }
            Ok(())
        }
        (Value::Number(_), Value::Number(t)) => {
            let t = t.as_f64().unwrap_or(f64::NAN);
            if !(t >= 0.0) {
                return Err(format!("{here}: tolerance must be non-negative, found {t}"));
            }
            Ok(())
        }
        (Value::Number(_), other) => Err(format!(
            "{here}: expected numeric tolerance, found {}",
            json_type_name(other)
        )),
        (e, t) if shape_of(e) == ValueShape::Scalar && shape_of(t) == ValueShape::Scalar => {
            // Non-numeric leaf: tolerance slot is a placeholder.
            Ok(())
        }
        (e, t) => Err(format!(
            "{here}: shape mismatch ({} vs {})",
            shape_of(e),
            shape_of(t)
        )),
    }
}

/// Human-readable JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_pair_mirrors() {
        assert!(tolerance_mirrors(&json!(1.5), &json!(0.1)).is_ok());
        assert!(tolerance_mirrors(&json!(1.5), &json!(0)).is_ok());
    }

    #[test]
    fn test_negative_tolerance_rejected() {
        let err = tolerance_mirrors(&json!(1.5), &json!(-0.1)).unwrap_err();
        assert!(err.contains("non-negative"));
    }

    #[test]
    fn test_string_leaf_allows_placeholder() {
        assert!(tolerance_mirrors(&json!("spiral"), &json!(null)).is_ok());
        assert!(tolerance_mirrors(&json!("spiral"), &json!(0)).is_ok());
    }

    #[test]
    fn test_nested_mirrors() {
        let expected = json!({"a": 1.0, "b": [2.0, 3.0]});
        let tolerance = json!({"a": 0.1, "b": [0.1, 0.1]});
        assert!(tolerance_mirrors(&expected, &tolerance).is_ok());
    }

    #[test]
    fn test_length_mismatch_names_path() {
        let expected = json!({"b": [2.0, 3.0]});
        let tolerance = json!({"b": [0.1]});
        let err = tolerance_mirrors(&expected, &tolerance).unwrap_err();
        assert!(err.starts_with("b:"), "unexpected message: {err}");
    }

    #[test]
    fn test_missing_key_rejected() {
        let expected = json!({"a": 1.0, "b": 2.0});
        let tolerance = json!({"a": 0.1});
        let err = tolerance_mirrors(&expected, &tolerance).unwrap_err();
        assert!(err.contains("missing key 'b'"));
    }

    #[test]
    fn test_extra_key_rejected() {
        let expected = json!({"a": 1.0});
        let tolerance = json!({"a": 0.1, "b": 0.1});
        let err = tolerance_mirrors(&expected, &tolerance).unwrap_err();
        assert!(err.contains("extra key 'b'"));
    }

    #[test]
    fn test_non_numeric_tolerance_at_numeric_leaf() {
        let expected = json!({"b": [2.0, 3.0]});
        let tolerance = json!({"b": [0.1, "loose"]});
        let err = tolerance_mirrors(&expected, &tolerance).unwrap_err();
        assert!(err.contains("b[1]"), "unexpected message: {err}");
    }

    #[test]
    fn test_leaf_count() {
        assert_eq!(leaf_count(&json!(1.0)), 1);
        assert_eq!(leaf_count(&json!({"a": 1.0, "b": [2.0, 3.0]})), 3);
        assert_eq!(leaf_count(&json!([])), 0);
    }
}
