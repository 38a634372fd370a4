//! Per-task outcomes and the per-paper evaluation report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::RunnerError;
use crate::grading::{Verdict, VerdictReason};

use super::config::RunBudgets;

/// How far a task got in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The agent was run on the task.
    Attempted,
    /// Skipped before the attempt because a parent did not resolve.
    Skipped,
    /// Never reached: the run's shared budget was exhausted first.
    NotAttempted,
}

/// Outcome of one task within a paper-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: String,
    /// How far the task got.
    pub status: TaskStatus,
    /// Raw extracted answer, when the agent produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    /// Verdict; absent only for attempted tasks of ungraded kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Messages the attempt consumed.
    pub messages_used: u32,
    /// Tokens the attempt consumed.
    pub tokens_used: u64,
    /// Wall time of the attempt in seconds.
    pub wall_time_secs: f64,
}

impl TaskOutcome {
    /// Outcome for an attempted task.
    pub fn attempted(
        task_id: impl Into<String>,
        answer: Option<Value>,
        verdict: Option<Verdict>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Attempted,
            answer,
            verdict,
            messages_used: 0,
            tokens_used: 0,
            wall_time_secs: 0.0,
        }
    }

    /// Outcome for a task skipped on an unmet dependency.
    pub fn skipped(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Skipped,
            answer: None,
            verdict: Some(Verdict::not_gradable(VerdictReason::UnmetDependency)),
            messages_used: 0,
            tokens_used: 0,
            wall_time_secs: 0.0,
        }
    }

    /// Outcome for a task never reached because the budget ran out.
    pub fn absent(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::NotAttempted,
            answer: None,
            verdict: Some(Verdict::not_gradable(VerdictReason::BudgetExhausted)),
            messages_used: 0,
            tokens_used: 0,
            wall_time_secs: 0.0,
        }
    }

    /// Attaches usage numbers.
    pub fn with_usage(mut self, messages: u32, tokens: u64, wall_time_secs: f64) -> Self {
        self.messages_used = messages;
        self.tokens_used = tokens;
        self.wall_time_secs = wall_time_secs;
        self
    }

    /// Whether this outcome passed grading.
    pub fn passed(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.passed)
    }
}

/// Aggregate pass-rate summary for a paper-run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks in the resolved plan.
    pub total: usize,
    /// Tasks the agent was run on.
    pub attempted: usize,
    /// Attempted tasks with a gradable kind.
    pub graded: usize,
    /// Graded tasks that passed.
    pub passed: usize,
    /// Tasks skipped on unmet dependencies.
    pub skipped: usize,
    /// Tasks never reached (budget exhausted).
    pub not_attempted: usize,
    /// passed / graded (0 when nothing was graded).
    pub pass_rate: f64,
}

impl RunSummary {
    fn compute(outcomes: &BTreeMap<String, TaskOutcome>) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes.values() {
            match outcome.status {
                TaskStatus::Attempted => {
                    summary.attempted += 1;
                    if outcome.verdict.is_some() {
                        summary.graded += 1;
                    }
                    if outcome.passed() {
                        summary.passed += 1;
                    }
                }
                TaskStatus::Skipped => summary.skipped += 1,
                TaskStatus::NotAttempted => summary.not_attempted += 1,
            }
        }
        if summary.graded > 0 {
            summary.pass_rate = summary.passed as f64 / summary.graded as f64;
        }
        summary
    }
}

/// The full record of one paper-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperReport {
    /// Unique run id.
    pub run_id: String,
    /// Paper evaluated.
    pub paper_id: String,
    /// Model the agent ran with.
    pub model: String,
    /// Sandbox backend name.
    pub backend: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run completed.
    pub completed_at: DateTime<Utc>,
    /// Budgets the run was held to.
    pub budgets: RunBudgets,
    /// Per-task outcomes in task-id order.
    pub outcomes: BTreeMap<String, TaskOutcome>,
    /// Aggregate summary.
    pub summary: RunSummary,
}

impl PaperReport {
    /// Starts an empty report for a run.
    pub fn new(
        run_id: impl Into<String>,
        paper_id: impl Into<String>,
        model: impl Into<String>,
        backend: impl Into<String>,
        budgets: RunBudgets,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            paper_id: paper_id.into(),
            model: model.into(),
            backend: backend.into(),
            started_at: now,
            completed_at: now,
            budgets,
            outcomes: BTreeMap::new(),
            summary: RunSummary::default(),
        }
    }

    /// Records one task outcome.
    pub fn record(&mut self, outcome: TaskOutcome) {
        self.outcomes.insert(outcome.task_id.clone(), outcome);
    }

    /// Recomputes the summary and stamps the completion time.
    pub fn finalize(&mut self) {
        self.summary = RunSummary::compute(&self.outcomes);
        self.completed_at = Utc::now();
    }

    /// Writes the report and per-task files under `<log_dir>/<paper_id>/`.
    pub fn save(&self, log_dir: &Path) -> Result<PathBuf, RunnerError> {
        let paper_dir = log_dir.join(&self.paper_id);
        let tasks_dir = paper_dir.join("tasks");
        fs::create_dir_all(&tasks_dir)?;

        for (task_id, outcome) in &self.outcomes {
            let path = tasks_dir.join(format!("{task_id}.json"));
            fs::write(&path, serde_json::to_string_pretty(outcome)?)?;
        }

        let report_path = paper_dir.join("report.json");
        fs::write(&report_path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved report to {}", report_path.display());
        Ok(report_path)
    }

    /// Whether a prior run of `paper_id` already left a report under
    /// `log_dir`. Batch mode skips such papers unless forced.
    pub fn exists(log_dir: &Path, paper_id: &str) -> bool {
        log_dir.join(paper_id).join("report.json").exists()
    }
}
