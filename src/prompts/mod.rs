//! Prompt construction for paper evaluation runs.
//!
//! Builds the system prompt, the paper-level context (manuscript,
//! execution requirements, dataset and workspace hints), and the
//! per-task prompt with the answer format the agent must submit.

use std::path::Path;

use serde_json::{json, Value};

use crate::dataset::{Paper, Task};

/// Base system prompt for the replication agent.
const SYSTEM_PROMPT: &str = "You are an expert researcher reproducing quantitative results \
from a scientific paper. You have shell and Python execution available inside an isolated \
workspace. Shell and Python state are ephemeral between calls: persist intermediate results \
to files. Work step by step and verify your numbers before submitting.";

/// How the agent must hand back its final answer.
const SUBMISSION_INSTRUCTIONS: &str = "When you are confident in your final answer, write it \
as JSON to a file named submission.json in the workspace root, matching the requested output \
format exactly. Use null for any value you cannot compute; never guess. Do not submit early \
unless the task is complete or impossible.";

/// The system prompt shared by every task in a run.
pub fn system_prompt() -> String {
    format!("{SYSTEM_PROMPT}\n\n{SUBMISSION_INSTRUCTIONS}")
}

/// Paper-level context: manuscript, requirements, datasets, and
/// workspace hints.
pub fn paper_prompt(paper: &Paper, workspace: Option<&Path>) -> String {
    let mut sections = Vec::new();

    sections.push(format!("# Paper: {}\n\n{}", paper.title, paper.abstract_text));

    if let Some(text) = &paper.full_text {
        sections.push(format!("## Manuscript\n\n{text}"));
    }

    let reqs = &paper.execution_requirements;
    if !reqs.code_language.is_empty() {
        sections.push(format!(
            "## Environment\n\nOriginal analysis language(s): {}.",
            reqs.code_language.join(", ")
        ));
    }

    for dataset in &paper.datasets {
        let mut lines = vec![format!("## Dataset: {}", dataset.dataset_name)];
        if let Some(instructions) = &dataset.data_instructions {
            lines.push(instructions.clone());
        }
        if let Some(dir) = workspace {
            lines.push(format!(
                "Pre-downloaded files, if any, are under {}.",
                dir.join("data").join(&dataset.dataset_name).display()
            ));
        }
        sections.push(lines.join("\n"));
    }

    if let Some(other) = &paper.other_instructions {
        sections.push(format!("## Additional instructions\n\n{other}"));
    }

    sections.join("\n\n")
}

/// Per-task prompt: description, instructions, answers from resolved
/// parent tasks, and the required output format.
pub fn task_prompt(task: &Task, parent_answers: &[(String, Value)]) -> String {
    let mut sections = Vec::new();

    sections.push(format!("# Task: {}\n\n{}", task.task_id, task.description));
    sections.push(task.instructions.join("\n\n"));

    if !parent_answers.is_empty() {
        let mut lines = vec!["## Results from earlier tasks".to_string()];
        for (task_id, answer) in parent_answers {
            lines.push(format!("- {}: {}", task_id, answer));
        }
        sections.push(lines.join("\n"));
    }

    sections.push(format!(
        "## Output format\n\nSubmit a JSON value of this exact shape (types in place of values):\n{}",
        serde_json::to_string_pretty(&output_schema(&task.expected_output)).unwrap_or_default()
    ));

    sections.join("\n\n")
}

/// The expected output with leaves replaced by type names, so the
/// agent learns the shape without seeing the answer.
pub fn output_schema(expected: &Value) -> Value {
    match expected {
        Value::Array(items) => Value::Array(items.iter().map(output_schema).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), output_schema(value)))
                .collect(),
        ),
        Value::Number(_) => json!("number"),
        Value::String(_) => json!("string"),
        Value::Bool(_) => json!("boolean"),
        Value::Null => json!(null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_schema_masks_values() {
        let expected = json!({"a": 1.0, "b": [2.0, "spiral"]});
        let schema = output_schema(&expected);
        assert_eq!(schema, json!({"a": "number", "b": ["number", "string"]}));
    }

    #[test]
    fn test_system_prompt_includes_submission_instructions() {
        let prompt = system_prompt();
        assert!(prompt.contains("submission.json"));
    }

    #[test]
    fn test_task_prompt_lists_parent_answers() {
        let task = Task {
            task_id: "child".to_string(),
            paper_id: "p".to_string(),
            kind: crate::dataset::TaskKind::Numeric,
            difficulty: 2,
            description: "desc".to_string(),
            instructions: vec!["step".to_string()],
            expected_output: json!(1.0),
            tolerance: json!(0.1),
            parents: vec!["parent".to_string()],
        };
        let prompt = task_prompt(&task, &[("parent".to_string(), json!(5.9))]);
        assert!(prompt.contains("Results from earlier tasks"));
        assert!(prompt.contains("parent: 5.9"));
        assert!(prompt.contains("number"));
    }
}
