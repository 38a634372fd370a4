//! Task specification records and load-time validation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::SchemaError;
use crate::grading::tolerance_mirrors;

/// Discriminator for how a task is graded.
///
/// Only [`TaskKind::Numeric`] is graded by this engine; other kinds are
/// preserved through loading and reported as ungraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Quantitative answer graded against `expected_output` with `tolerance`.
    Numeric,
    /// Code artifact; not graded by this engine.
    Code,
    /// Qualitative answer; not graded by this engine.
    Qualitative,
    /// Any future kind.
    #[serde(other)]
    Other,
}

/// One gradable sub-question derived from a paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identifier, unique within the owning paper.
    pub task_id: String,
    /// Owning paper id.
    pub paper_id: String,
    /// Grading discriminator.
    pub kind: TaskKind,
    /// Difficulty 1-10, a log-scaled estimate of expert time.
    pub difficulty: u8,
    /// Short human-readable description.
    pub description: String,
    /// Full instructions. The specification format accepts a single
    /// string or a list; both normalize to a list.
    #[serde(deserialize_with = "string_or_list")]
    pub instructions: Vec<String>,
    /// Expected answer: a float or an arbitrarily nested composite of
    /// floats and strings.
    pub expected_output: Value,
    /// Allowed absolute deviation per leaf; mirrors `expected_output`.
    pub tolerance: Value,
    /// Parent task ids that must resolve before this task is attempted.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl Task {
    /// Validates the task record against the schema rules that can be
    /// checked without the rest of the paper: difficulty range and the
    /// tolerance/expected-output shape mirror. Runs eagerly at load time
    /// so malformed authoring is caught before any agent run is spent.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if !(1..=10).contains(&self.difficulty) {
            return Err(SchemaError::InvalidDifficulty {
                task_id: self.task_id.clone(),
                difficulty: i64::from(self.difficulty),
            });
        }
        tolerance_mirrors(&self.expected_output, &self.tolerance).map_err(|reason| {
            SchemaError::ToleranceShapeMismatch {
                task_id: self.task_id.clone(),
                reason,
            }
        })
    }
}

/// Accepts `"text"` or `["text", ...]`.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(s) => vec![s],
        StringOrList::Many(v) => v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task_json() -> serde_json::Value {
        json!({
            "task_id": "default_mbh_mass",
            "paper_id": "gw_nsbh",
            "kind": "numeric",
            "difficulty": 4,
            "description": "Median black hole mass under the default prior",
            "instructions": "Compute the median and report it in solar masses.",
            "expected_output": 5.9,
            "tolerance": 0.2,
            "parents": []
        })
    }

    #[test]
    fn test_task_deserializes_scalar_instructions() {
        let task: Task = serde_json::from_value(sample_task_json()).unwrap();
        assert_eq!(task.kind, TaskKind::Numeric);
        assert_eq!(task.instructions.len(), 1);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_task_deserializes_list_instructions() {
        let mut value = sample_task_json();
        value["instructions"] = json!(["Step one.", "Step two."]);
        let task: Task = serde_json::from_value(value).unwrap();
        assert_eq!(task.instructions.len(), 2);
    }

    #[test]
    fn test_unknown_kind_maps_to_other() {
        let mut value = sample_task_json();
        value["kind"] = json!("figure");
        let task: Task = serde_json::from_value(value).unwrap();
        assert_eq!(task.kind, TaskKind::Other);
    }

    #[test]
    fn test_difficulty_out_of_range_rejected() {
        let mut value = sample_task_json();
        value["difficulty"] = json!(11);
        let task: Task = serde_json::from_value(value).unwrap();
        assert!(matches!(
            task.validate(),
            Err(SchemaError::InvalidDifficulty { difficulty: 11, .. })
        ));
    }

    #[test]
    fn test_tolerance_shape_mismatch_rejected() {
        let mut value = sample_task_json();
        value["expected_output"] = json!({"a": 1.0, "b": [2.0, 3.0]});
        value["tolerance"] = json!({"a": 0.1, "b": [0.1]});
        let task: Task = serde_json::from_value(value).unwrap();
        let err = task.validate().unwrap_err();
        assert!(matches!(err, SchemaError::ToleranceShapeMismatch { .. }));
    }
}
