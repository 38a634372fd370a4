//! Loading papers and tasks from structured specification files.
//!
//! Layout on disk mirrors the specification archive: one JSON file per
//! paper under the papers directory, one directory of task JSON files
//! per paper under the tasks directory, and optional manuscript text
//! files (masked or unmasked) under the manuscripts directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::SchemaError;

use super::paper::Paper;
use super::task::{Task, TaskKind};

/// Result of a batch load: papers that loaded cleanly plus per-paper
/// schema failures. One bad specification never aborts the batch.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Papers keyed by paper id, deterministically ordered.
    pub papers: BTreeMap<String, Paper>,
    /// Papers that failed to load, with the error that rejected them.
    pub failures: Vec<(String, SchemaError)>,
}

impl LoadReport {
    /// Converts the report into a map, failing on the first bad paper.
    pub fn into_strict(self) -> Result<BTreeMap<String, Paper>, SchemaError> {
        match self.failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.papers),
        }
    }
}

/// Loads papers with their tasks and manuscript text.
///
/// The paper is the atomic unit: each [`Paper`] carries its tasks and
/// text. Filters that match nothing yield an empty result, never an
/// error.
#[derive(Debug, Clone)]
pub struct PaperLoader {
    papers_dir: PathBuf,
    tasks_dir: PathBuf,
    manuscripts_dir: Option<PathBuf>,
    paper_ids: Option<Vec<String>>,
    task_kinds: Option<Vec<TaskKind>>,
    filters: Vec<(String, String)>,
    masked: bool,
}

impl PaperLoader {
    /// Creates a loader over the given papers and tasks directories.
    pub fn new(papers_dir: impl Into<PathBuf>, tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            papers_dir: papers_dir.into(),
            tasks_dir: tasks_dir.into(),
            manuscripts_dir: None,
            paper_ids: None,
            task_kinds: None,
            filters: Vec::new(),
            masked: true,
        }
    }

    /// Sets the manuscripts directory; without it papers load with no text.
    pub fn with_manuscripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manuscripts_dir = Some(dir.into());
        self
    }

    /// Restricts loading to specific paper ids.
    pub fn with_paper_ids(mut self, ids: Vec<String>) -> Self {
        self.paper_ids = Some(ids);
        self
    }

    /// Restricts loaded tasks to the given kinds.
    pub fn with_task_kinds(mut self, kinds: Vec<TaskKind>) -> Self {
        self.task_kinds = Some(kinds);
        self
    }

    /// Adds a metadata filter (e.g. `source = "expert"`). All filters
    /// must match (AND logic).
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Selects masked vs unmasked manuscript text (masked by default).
    pub fn with_masked(mut self, masked: bool) -> Self {
        self.masked = masked;
        self
    }

    /// Loads all matching papers, isolating per-paper schema failures.
    pub fn load(&self) -> LoadReport {
        let mut report = LoadReport::default();

        for paper_file in self.discover_papers() {
            let paper_id = paper_file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();

            if let Some(ids) = &self.paper_ids {
                if !ids.iter().any(|id| id == &paper_id) {
                    continue;
                }
            }

            match self.load_paper(&paper_file, &paper_id) {
                Ok(Some(paper)) => {
                    report.papers.insert(paper.paper_id.clone(), paper);
                }
                Ok(None) => {} // filtered out
                Err(err) => {
                    warn!("Skipping paper '{}': {}", paper_id, err);
                    report.failures.push((paper_id, err));
                }
            }
        }

        info!(
            "Loaded {} paper(s), {} rejected",
            report.papers.len(),
            report.failures.len()
        );
        report
    }

    /// Finds all paper JSON files, sorted for deterministic order.
    fn discover_papers(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.papers_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
    }

    /// Loads one paper with its tasks and text. Returns `Ok(None)` when
    /// a metadata filter rejects it.
    fn load_paper(&self, path: &Path, paper_id: &str) -> Result<Option<Paper>, SchemaError> {
        let contents = fs::read_to_string(path)?;
        let mut paper: Paper =
            serde_json::from_str(&contents).map_err(|e| SchemaError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        for (field, value) in &self.filters {
            if !paper.matches_filter(field, value) {
                debug!("Paper '{}' rejected by filter {}={}", paper_id, field, value);
                return Ok(None);
            }
        }

        paper.tasks = self.load_tasks(&paper.paper_id)?;
        validate_paper(&paper)?;

        if let Some(dir) = &self.manuscripts_dir {
            paper.full_text = load_manuscript(dir, &paper.paper_id, self.masked);
        }

        Ok(Some(paper))
    }

    /// Loads all task files for a paper from `<tasks_dir>/<paper_id>/`.
    fn load_tasks(
        &self,
        paper_id: &str,
    ) -> Result<std::collections::HashMap<String, Task>, SchemaError> {
        let task_dir = self.tasks_dir.join(paper_id);
        let mut tasks = std::collections::HashMap::new();

        if !task_dir.exists() {
            debug!("No task directory for paper '{}'", paper_id);
            return Ok(tasks);
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&task_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        for file in files {
            let contents = fs::read_to_string(&file)?;
            let task: Task =
                serde_json::from_str(&contents).map_err(|e| SchemaError::ParseError {
                    path: file.display().to_string(),
                    message: e.to_string(),
                })?;

            if task.paper_id != paper_id {
                return Err(SchemaError::PaperMismatch {
                    path: file.display().to_string(),
                    paper_id: paper_id.to_string(),
                    declared: task.paper_id.clone(),
                });
            }

            if let Some(kinds) = &self.task_kinds {
                if !kinds.contains(&task.kind) {
                    continue;
                }
            }

            task.validate()?;

            if tasks.contains_key(&task.task_id) {
                return Err(SchemaError::DuplicateTask {
                    paper_id: paper_id.to_string(),
                    task_id: task.task_id,
                });
            }
            tasks.insert(task.task_id.clone(), task);
        }

        Ok(tasks)
    }
}

/// Cross-task validation: every task valid on its own, every declared
/// parent present in the same paper.
pub fn validate_paper(paper: &Paper) -> Result<(), SchemaError> {
    for task in paper.tasks.values() {
        task.validate()?;
        for parent in &task.parents {
            if !paper.tasks.contains_key(parent) {
                return Err(SchemaError::UnknownParent {
                    task_id: task.task_id.clone(),
                    parent_id: parent.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Loads manuscript text, preferring the masked/unmasked variant and
/// falling back to the bare `<paper_id>.txt`.
fn load_manuscript(dir: &Path, paper_id: &str, masked: bool) -> Option<String> {
    let suffix = if masked { "_masked" } else { "_full" };
    let candidates = [
        dir.join(format!("{paper_id}{suffix}.txt")),
        dir.join(format!("{paper_id}.txt")),
    ];
    for path in candidates {
        match fs::read_to_string(&path) {
            Ok(text) => return Some(text),
            Err(_) => continue,
        }
    }
    debug!("No manuscript found for paper '{}'", paper_id);
    None
}

/// Loads whole papers (tasks inline) from a JSONL file, one paper per
/// line. Schema failures are isolated per line like directory loading.
pub fn from_jsonl(path: &Path) -> Result<LoadReport, SchemaError> {
    let file = fs::File::open(path)?;
    let mut report = LoadReport::default();

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: Result<Paper, _> = serde_json::from_str(&line);
        match parsed {
            Ok(paper) => match validate_paper(&paper) {
                Ok(()) => {
                    report.papers.insert(paper.paper_id.clone(), paper);
                }
                Err(err) => report.failures.push((paper.paper_id.clone(), err)),
            },
            Err(e) => {
                report.failures.push((
                    format!("line {}", lineno + 1),
                    SchemaError::ParseError {
                        path: format!("{}:{}", path.display(), lineno + 1),
                        message: e.to_string(),
                    },
                ));
            }
        }
    }

    Ok(report)
}

/// Exports papers to JSONL, one complete paper per line.
pub fn export_to_jsonl(
    papers: &BTreeMap<String, Paper>,
    path: &Path,
    include_text: bool,
    include_tasks: bool,
) -> Result<(), SchemaError> {
    let mut out = fs::File::create(path)?;
    for paper in papers.values() {
        let mut value = serde_json::to_value(paper)?;
        if let Some(map) = value.as_object_mut() {
            if !include_text {
                map.remove("full_text");
            }
            if !include_tasks {
                map.remove("tasks");
            }
        }
        writeln!(out, "{}", serde_json::to_string(&value)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_paper(dir: &Path, paper_id: &str, source: &str) {
        let value = json!({
            "paper_id": paper_id,
            "title": format!("Paper {paper_id}"),
            "abstract": "Test abstract.",
            "publication_date": "2023-01-15",
            "source": source,
        });
        fs::write(
            dir.join(format!("{paper_id}.json")),
            serde_json::to_string_pretty(&value).unwrap(),
        )
        .unwrap();
    }

    fn write_task(dir: &Path, paper_id: &str, task_id: &str, value: serde_json::Value) {
        let task_dir = dir.join(paper_id);
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(
            task_dir.join(format!("{task_id}.json")),
            serde_json::to_string_pretty(&value).unwrap(),
        )
        .unwrap();
    }

    fn task_json(paper_id: &str, task_id: &str) -> serde_json::Value {
        json!({
            "task_id": task_id,
            "paper_id": paper_id,
            "kind": "numeric",
            "difficulty": 3,
            "description": "desc",
            "instructions": "do it",
            "expected_output": 1.0,
            "tolerance": 0.1,
        })
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let papers = temp.path().join("papers");
        let tasks = temp.path().join("tasks");
        fs::create_dir_all(&papers).unwrap();
        fs::create_dir_all(&tasks).unwrap();
        (temp, papers, tasks)
    }

    #[test]
    fn test_load_papers_with_tasks() {
        let (_temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        write_task(&tasks, "alpha", "t1", task_json("alpha", "t1"));
        write_task(&tasks, "alpha", "t2", task_json("alpha", "t2"));

        let report = PaperLoader::new(&papers, &tasks).load();
        assert!(report.failures.is_empty());
        assert_eq!(report.papers["alpha"].tasks.len(), 2);
    }

    #[test]
    fn test_filter_matches_nothing_yields_empty() {
        let (_temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");

        let report = PaperLoader::new(&papers, &tasks)
            .with_filter("source", "showyourwork")
            .load();
        assert!(report.papers.is_empty());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_filter_selects_matching_source() {
        let (_temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        write_paper(&papers, "beta", "showyourwork");

        let report = PaperLoader::new(&papers, &tasks)
            .with_filter("source", "expert")
            .load();
        assert_eq!(report.papers.len(), 1);
        assert!(report.papers.contains_key("alpha"));
    }

    #[test]
    fn test_bad_tolerance_shape_isolated_per_paper() {
        let (_temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        write_paper(&papers, "beta", "expert");

        let mut bad = task_json("alpha", "t1");
        bad["expected_output"] = json!([1.0, 2.0]);
        bad["tolerance"] = json!([0.1]);
        write_task(&tasks, "alpha", "t1", bad);
        write_task(&tasks, "beta", "t1", task_json("beta", "t1"));

        let report = PaperLoader::new(&papers, &tasks).load();
        assert_eq!(report.papers.len(), 1);
        assert!(report.papers.contains_key("beta"));
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].1,
            SchemaError::ToleranceShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let (_temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        let mut task = task_json("alpha", "t1");
        task["parents"] = json!(["missing"]);
        write_task(&tasks, "alpha", "t1", task);

        let report = PaperLoader::new(&papers, &tasks).load();
        assert!(report.papers.is_empty());
        assert!(matches!(
            report.failures[0].1,
            SchemaError::UnknownParent { .. }
        ));
    }

    #[test]
    fn test_task_kind_filter() {
        let (_temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        write_task(&tasks, "alpha", "t1", task_json("alpha", "t1"));
        let mut code = task_json("alpha", "t2");
        code["kind"] = json!("code");
        write_task(&tasks, "alpha", "t2", code);

        let report = PaperLoader::new(&papers, &tasks)
            .with_task_kinds(vec![TaskKind::Numeric])
            .load();
        assert_eq!(report.papers["alpha"].tasks.len(), 1);
    }

    #[test]
    fn test_manuscript_loading_masked() {
        let (temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        let manuscripts = temp.path().join("manuscripts");
        fs::create_dir_all(&manuscripts).unwrap();
        fs::write(manuscripts.join("alpha_masked.txt"), "masked text").unwrap();

        let report = PaperLoader::new(&papers, &tasks)
            .with_manuscripts_dir(&manuscripts)
            .load();
        assert_eq!(report.papers["alpha"].full_text.as_deref(), Some("masked text"));
    }

    #[test]
    fn test_jsonl_round_trip() {
        let (temp, papers, tasks) = setup();
        write_paper(&papers, "alpha", "expert");
        write_task(&tasks, "alpha", "t1", task_json("alpha", "t1"));

        let loaded = PaperLoader::new(&papers, &tasks).load().papers;
        let jsonl = temp.path().join("papers.jsonl");
        export_to_jsonl(&loaded, &jsonl, true, true).unwrap();

        let reloaded = from_jsonl(&jsonl).unwrap();
        assert!(reloaded.failures.is_empty());
        assert_eq!(reloaded.papers["alpha"].tasks.len(), 1);
        assert_eq!(reloaded.papers["alpha"].tasks["t1"].difficulty, 3);
    }
}
