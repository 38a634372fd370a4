//! Grading engine: tolerance-based comparison of agent answers.
//!
//! [`grade`] compares a produced answer against the expected output using
//! a type-aware tolerance rule that generalizes across scalars, ordered
//! sequences, and key-value mappings. It never returns an error: missing
//! answers and malformed structures become non-passing verdicts with a
//! reason code, so a batch grading pass always completes.

pub mod shape;

pub use shape::{leaf_count, shape_of, tolerance_mirrors, ValueShape};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::{Task, TaskKind};
use shape::{index_path, key_path};

/// Reason a task attempt could not be graded on its merits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    /// The answer's composite shape does not match the expected output.
    StructureMismatch,
    /// The agent never produced a parseable final answer.
    NoAnswer,
    /// The run's shared budget was exhausted before this task was attempted.
    BudgetExhausted,
    /// A parent task was not resolved, so this task was never attempted.
    UnmetDependency,
}

impl std::fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StructureMismatch => write!(f, "structure_mismatch"),
            Self::NoAnswer => write!(f, "no_answer"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::UnmetDependency => write!(f, "unmet_dependency"),
        }
    }
}

/// Comparison record for a single leaf of the expected structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafCheck {
    /// Structural path of the leaf, e.g. `b[1]` (empty for a bare scalar).
    pub path: String,
    /// Expected value at this leaf.
    pub expected: Value,
    /// Value the agent produced at this leaf.
    pub actual: Value,
    /// Allowed absolute deviation; absent for non-numeric leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    /// Normalized deviation `|a - e| / t` (absolute where `t == 0`);
    /// absent for non-numeric leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    /// Whether this leaf passed.
    pub passed: bool,
}

/// The graded outcome for one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether every leaf passed its tolerance check.
    pub passed: bool,
    /// Maximum leaf deviation; absent when the attempt was not gradable
    /// or the expected output has no numeric leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    /// Path of the worst-deviating (or mismatching) leaf.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_path: Option<String>,
    /// Set when the attempt was not gradable on its merits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
    /// Per-leaf breakdown (empty when not gradable).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leaves: Vec<LeafCheck>,
}

impl Verdict {
    /// A failing verdict with a reason code and no per-leaf data.
    pub fn not_gradable(reason: VerdictReason) -> Self {
        Self {
            passed: false,
            deviation: None,
            worst_path: None,
            reason: Some(reason),
            leaves: Vec::new(),
        }
    }
}

/// Grades `actual` against `expected` under `tolerance`.
///
/// `tolerance` must mirror the shape of `expected` (validated at load
/// time by the registry); `actual` is untrusted agent output and any
/// structural divergence fails with `structure_mismatch`. A missing
/// answer fails with `no_answer` regardless of tolerance.
pub fn grade(expected: &Value, tolerance: &Value, actual: Option<&Value>) -> Verdict {
    let Some(actual) = actual else {
        return Verdict::not_gradable(VerdictReason::NoAnswer);
    };

    let mut leaves = Vec::new();
    if let Err(path) = compare_at(expected, tolerance, actual, "", &mut leaves) {
        let mut verdict = Verdict::not_gradable(VerdictReason::StructureMismatch);
        verdict.worst_path = Some(if path.is_empty() { "<root>".into() } else { path });
        return verdict;
    }

    let passed = leaves.iter().all(|leaf| leaf.passed);
    let mut deviation = None;
    let mut worst_path = None;
    for leaf in &leaves {
        if let Some(dev) = leaf.deviation {
            if deviation.map_or(true, |max: f64| dev > max) {
                deviation = Some(dev);
                worst_path = Some(leaf.path.clone());
            }
        }
    }
    if !passed {
        // Attribute failure to the worst failing leaf; a mismatching
        // non-numeric leaf (no deviation) outranks any numeric one.
        let worst_fail = leaves.iter().filter(|leaf| !leaf.passed).max_by(|a, b| {
            let da = a.deviation.unwrap_or(f64::INFINITY);
            let db = b.deviation.unwrap_or(f64::INFINITY);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(leaf) = worst_fail {
            worst_path = Some(leaf.path.clone());
        }
    }

    Verdict {
        passed,
        deviation,
        worst_path,
        reason: None,
        leaves,
    }
}

/// Grades a task attempt, dispatching on the task kind tag.
///
/// Only the numeric-answer kind is graded by this engine; other kinds
/// return `None` and are reported as ungraded.
pub fn grade_task(task: &Task, actual: Option<&Value>) -> Option<Verdict> {
    match task.kind {
        TaskKind::Numeric => Some(grade(&task.expected_output, &task.tolerance, actual)),
        _ => None,
    }
}

/// Recursive structural comparison. Returns `Err(path)` on a shape
/// mismatch; collects a [`LeafCheck`] per scalar leaf otherwise.
fn compare_at(
    expected: &Value,
    tolerance: &Value,
    actual: &Value,
    path: &str,
    leaves: &mut Vec<LeafCheck>,
) -> Result<(), String> {
    match (expected, actual) {
        (Value::Array(exp), Value::Array(act)) => {
            if exp.len() != act.len() {
                return Err(path.to_string());
            }
            let tol = match tolerance {
                Value::Array(tol) if tol.len() == exp.len() => tol,
                _ => return Err(path.to_string()),
            };
            for (idx, (e, a)) in exp.iter().zip(act.iter()).enumerate() {
                compare_at(e, &tol[idx], a, &index_path(path, idx), leaves)?;
            }
            Ok(())
        }
        (Value::Object(exp), Value::Object(act)) => {
            if exp.len() != act.len() || exp.keys().any(|key| !act.contains_key(key)) {
                return Err(path.to_string());
            }
            let tol = match tolerance {
                Value::Object(tol) => tol,
                _ => return Err(path.to_string()),
            };
            for (key, e) in exp {
                let t = tol.get(key).ok_or_else(|| path.to_string())?;
                compare_at(e, t, &act[key], &key_path(path, key), leaves)?;
            }
            Ok(())
        }
        (Value::Number(e), Value::Number(a)) => {
            let t = tolerance
                .as_f64()
                .ok_or_else(|| path.to_string())?
                .max(0.0);
            let e = e.as_f64().unwrap_or(f64::NAN);
            let a = a.as_f64().unwrap_or(f64::NAN);
            let abs = (a - e).abs();
            let passed = abs <= t;
            let deviation = if t > 0.0 { abs / t } else { abs };
            leaves.push(LeafCheck {
                path: path.to_string(),
                expected: expected.clone(),
                actual: actual.clone(),
                tolerance: Some(t),
                deviation: Some(deviation),
                passed,
            });
            Ok(())
        }
        (Value::Number(_), _) => {
            // A numeric leaf cannot be graded against a non-numeric answer.
            Err(path.to_string())
        }
        (e, a) if shape_of(e) == ValueShape::Scalar => {
            if shape_of(a) != ValueShape::Scalar {
                return Err(path.to_string());
            }
            // Non-numeric leaf: exact equality, tolerance bypassed.
            leaves.push(LeafCheck {
                path: path.to_string(),
                expected: e.clone(),
                actual: a.clone(),
                tolerance: None,
                deviation: None,
                passed: e == a,
            });
            Ok(())
        }
        _ => Err(path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_answer_is_no_answer() {
        let verdict = grade(&json!(10.0), &json!(0.5), None);
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, Some(VerdictReason::NoAnswer));
        assert!(verdict.deviation.is_none());
    }

    #[test]
    fn test_reflexive() {
        let expected = json!({"a": 1.0, "b": [2.0, 3.0], "c": "spiral"});
        let tolerance = json!({"a": 0.0, "b": [0.1, 0.0], "c": null});
        let verdict = grade(&expected, &tolerance, Some(&expected));
        assert!(verdict.passed);
        assert_eq!(verdict.deviation, Some(0.0));
    }

    #[test]
    fn test_boundary_equality_passes() {
        let verdict = grade(&json!(10.0), &json!(0.5), Some(&json!(10.5)));
        assert!(verdict.passed);
        assert_eq!(verdict.deviation, Some(1.0));
    }

    #[test]
    fn test_just_over_boundary_fails() {
        let verdict = grade(&json!(10.0), &json!(0.5), Some(&json!(10.51)));
        assert!(!verdict.passed);
        assert!(verdict.reason.is_none(), "graded failure carries no reason code");
        assert!(verdict.deviation.unwrap() > 1.0);
    }

    #[test]
    fn test_nested_failure_attributed_to_leaf() {
        let expected = json!({"a": 1.0, "b": [2.0, 3.0]});
        let tolerance = json!({"a": 0.1, "b": [0.1, 0.1]});
        let actual = json!({"a": 1.05, "b": [2.0, 3.2]});
        let verdict = grade(&expected, &tolerance, Some(&actual));
        assert!(!verdict.passed);
        assert_eq!(verdict.worst_path.as_deref(), Some("b[1]"));
        let dev = verdict.deviation.unwrap();
        assert!((dev - 2.0).abs() < 1e-9, "deviation {dev}");
    }

    #[test]
    fn test_zero_tolerance_requires_exact_equality() {
        assert!(grade(&json!(3.0), &json!(0.0), Some(&json!(3.0))).passed);
        let verdict = grade(&json!(3.0), &json!(0.0), Some(&json!(3.0001)));
        assert!(!verdict.passed);
        // Deviation is absolute where tolerance is zero.
        assert!((verdict.deviation.unwrap() - 0.0001).abs() < 1e-9);
    }

    #[test]
    fn test_sequence_length_mismatch() {
        let verdict = grade(
            &json!([1.0, 2.0]),
            &json!([0.1, 0.1]),
            Some(&json!([1.0, 2.0, 3.0])),
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, Some(VerdictReason::StructureMismatch));
    }

    #[test]
    fn test_mapping_key_mismatch() {
        let verdict = grade(
            &json!({"a": 1.0}),
            &json!({"a": 0.1}),
            Some(&json!({"z": 1.0})),
        );
        assert_eq!(verdict.reason, Some(VerdictReason::StructureMismatch));
    }

    #[test]
    fn test_null_answer_leaf_is_structure_mismatch() {
        let verdict = grade(
            &json!({"a": 1.0}),
            &json!({"a": 0.1}),
            Some(&json!({"a": null})),
        );
        assert_eq!(verdict.reason, Some(VerdictReason::StructureMismatch));
        assert_eq!(verdict.worst_path.as_deref(), Some("a"));
    }

    #[test]
    fn test_string_leaf_exact_equality() {
        let expected = json!({"class": "spiral", "n": 4.0});
        let tolerance = json!({"class": null, "n": 0.5});
        let ok = json!({"class": "spiral", "n": 4.2});
        assert!(grade(&expected, &tolerance, Some(&ok)).passed);

        let bad = json!({"class": "elliptical", "n": 4.2});
        let verdict = grade(&expected, &tolerance, Some(&bad));
        assert!(!verdict.passed);
        assert!(verdict.reason.is_none());
        assert_eq!(verdict.worst_path.as_deref(), Some("class"));
    }

    #[test]
    fn test_scalar_vs_composite_mismatch() {
        let verdict = grade(&json!(1.0), &json!(0.1), Some(&json!([1.0])));
        assert_eq!(verdict.reason, Some(VerdictReason::StructureMismatch));
    }

    #[test]
    fn test_deviation_is_max_over_leaves() {
        let expected = json!([10.0, 20.0]);
        let tolerance = json!([1.0, 2.0]);
        let actual = json!([10.5, 21.5]);
        let verdict = grade(&expected, &tolerance, Some(&actual));
        assert!(verdict.passed);
        // 0.5/1.0 = 0.5, 1.5/2.0 = 0.75
        assert!((verdict.deviation.unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(verdict.worst_path.as_deref(), Some("[1]"));
    }

    #[test]
    fn test_integer_and_float_interchangeable() {
        let verdict = grade(&json!(4), &json!(0.5), Some(&json!(4.4)));
        assert!(verdict.passed);
    }

    #[test]
    fn test_grade_task_dispatches_on_kind() {
        let mut task = Task {
            task_id: "t".to_string(),
            paper_id: "p".to_string(),
            kind: TaskKind::Numeric,
            difficulty: 1,
            description: String::new(),
            instructions: vec![],
            expected_output: json!(1.0),
            tolerance: json!(0.1),
            parents: vec![],
        };
        assert!(grade_task(&task, Some(&json!(1.0))).is_some());

        task.kind = TaskKind::Code;
        assert!(grade_task(&task, Some(&json!(1.0))).is_none());
    }
}
