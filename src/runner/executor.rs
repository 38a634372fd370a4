//! Evaluation runner: drives one agent through one paper's task set.
//!
//! Tasks run strictly sequentially in resolver order inside a single
//! sandbox, sharing one message/token/wall-clock budget across the
//! whole paper-run. Cancellation is checked at every suspension point,
//! and sandbox teardown runs on every exit path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dataset::{Paper, Task};
use crate::error::RunnerError;
use crate::grading::grade_task;
use crate::prompts;
use crate::resolver;
use crate::sandbox::{PrepareOptions, SandboxHandle, SandboxManager};

use super::agent::{AgentDriver, TaskRequest};
use super::config::HarnessConfig;
use super::report::{PaperReport, TaskOutcome};

/// Runs agents against papers under a harness configuration.
pub struct EvalRunner {
    manager: SandboxManager,
    agent: Arc<dyn AgentDriver>,
    config: HarnessConfig,
}

impl EvalRunner {
    /// Creates a runner over a sandbox manager and an agent driver.
    pub fn new(manager: SandboxManager, agent: Arc<dyn AgentDriver>, config: HarnessConfig) -> Self {
        Self {
            manager,
            agent,
            config,
        }
    }

    /// The harness configuration this runner was built with.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Evaluates one paper end to end: resolve order, prepare sandbox,
    /// run the agent task by task, grade, persist the report.
    ///
    /// The report is persisted even when the run ends early (operator
    /// abort or agent failure), and teardown is guaranteed on every
    /// exit path past preparation.
    pub async fn evaluate_paper(
        &self,
        paper: &Paper,
        cancel: &CancellationToken,
    ) -> Result<PaperReport, RunnerError> {
        let order = resolver::resolve(paper)?;
        let run_id = format!("run-{}", Uuid::new_v4());

        info!(
            "Starting {} for paper '{}' ({} task(s), model {})",
            run_id,
            paper.paper_id,
            order.len(),
            self.config.model
        );

        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let opts = PrepareOptions {
            download_data: self.config.download_data,
            install_deps: self.config.install_deps,
        };
        let handle = self
            .manager
            .prepare(paper, &self.config.workspace_base, &run_id, &opts)
            .await?;

        let mut report = PaperReport::new(
            &run_id,
            &paper.paper_id,
            &self.config.model,
            self.manager.backend().name(),
            self.config.budgets,
        );

        let run_result = self
            .run_tasks(paper, &order, &handle, &mut report, cancel)
            .await;

        report.finalize();
        if let Err(err) = report.save(&self.config.log_dir) {
            warn!("Failed to persist report for '{}': {}", paper.paper_id, err);
        }

        if self.config.keep_sandbox {
            self.manager.release(handle);
        } else if let Err(err) = self.manager.teardown(handle).await {
            warn!("Teardown for '{}' failed: {}", paper.paper_id, err);
        }

        run_result?;

        info!(
            "Finished '{}': {}/{} graded tasks passed",
            paper.paper_id, report.summary.passed, report.summary.graded
        );
        Ok(report)
    }

    /// The sequential task loop. Returns early only on cancellation or
    /// an agent invocation failure; budget breaches are recorded as
    /// outcomes, not errors.
    async fn run_tasks(
        &self,
        paper: &Paper,
        order: &[&Task],
        handle: &SandboxHandle,
        report: &mut PaperReport,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let budgets = self.config.budgets;
        let deadline = Instant::now() + budgets.time_limit();
        let mut messages_used: u32 = 0;
        let mut tokens_used: u64 = 0;
        let mut budget_exhausted = false;

        // Tasks that produced an answer; dependents of anything else
        // are skipped rather than attempted.
        let mut resolved: HashSet<String> = HashSet::new();
        let mut answers: HashMap<String, Value> = HashMap::new();

        let system_prompt = prompts::system_prompt();
        let paper_context =
            prompts::paper_prompt(paper, Some(handle.backend_handle.workspace_dir.as_path()));

        for task in order {
            if cancel.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }

            if !budget_exhausted {
                let over_messages = messages_used >= budgets.message_limit;
                let over_tokens = tokens_used >= budgets.token_limit;
                let over_time = Instant::now() >= deadline;
                if over_messages || over_tokens || over_time {
                    info!(
                        "Budget exhausted for '{}' (messages: {}, tokens: {}, time up: {})",
                        paper.paper_id, over_messages, over_tokens, over_time
                    );
                    budget_exhausted = true;
                }
            }
            if budget_exhausted {
                report.record(TaskOutcome::absent(&task.task_id));
                continue;
            }

            let unmet = resolver::unmet_parents(task, &resolved);
            if !unmet.is_empty() {
                debug!(
                    "Skipping '{}': unmet parent(s) {:?}",
                    task.task_id, unmet
                );
                report.record(TaskOutcome::skipped(&task.task_id));
                continue;
            }

            let parent_answers: Vec<(String, Value)> = task
                .parents
                .iter()
                .filter_map(|parent| answers.get(parent).map(|v| (parent.clone(), v.clone())))
                .collect();
            let prompt = format!(
                "{}\n\n{}",
                paper_context,
                prompts::task_prompt(task, &parent_answers)
            );

            let remaining_time = deadline.saturating_duration_since(Instant::now());
            let request = TaskRequest {
                paper_id: &paper.paper_id,
                task_id: &task.task_id,
                model: &self.config.model,
                system_prompt: &system_prompt,
                prompt: &prompt,
                backend: self.manager.backend().as_ref(),
                handle: &handle.backend_handle,
                workspace_host: handle.workspace.root(),
                execution_timeout: budgets.execution_timeout(),
                remaining_messages: budgets.message_limit - messages_used,
                remaining_tokens: budgets.token_limit - tokens_used,
                remaining_time,
            };

            let start = Instant::now();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                result = tokio::time::timeout(remaining_time, self.agent.attempt(request)) => {
                    match result {
                        Ok(attempt) => attempt?,
                        Err(_) => {
                            warn!(
                                "Wall-clock limit hit during task '{}' of '{}'",
                                task.task_id, paper.paper_id
                            );
                            budget_exhausted = true;
                            report.record(TaskOutcome::absent(&task.task_id));
                            continue;
                        }
                    }
                }
            };
            let wall_time = start.elapsed();

            messages_used = messages_used.saturating_add(attempt.messages_used);
            tokens_used = tokens_used.saturating_add(attempt.tokens_used);

            if let Some(answer) = &attempt.answer {
                resolved.insert(task.task_id.clone());
                answers.insert(task.task_id.clone(), answer.clone());
            }

            let verdict = grade_task(task, attempt.answer.as_ref());
            match &verdict {
                Some(v) => info!(
                    "Task '{}': {} (deviation {:?})",
                    task.task_id,
                    if v.passed { "PASS" } else { "FAIL" },
                    v.deviation
                ),
                None => info!("Task '{}': ungraded kind", task.task_id),
            }

            report.record(
                TaskOutcome::attempted(&task.task_id, attempt.answer, verdict).with_usage(
                    attempt.messages_used,
                    attempt.tokens_used,
                    wall_time.as_secs_f64(),
                ),
            );
        }

        Ok(())
    }
}

/// Evaluates many papers in parallel across independent sandboxes.
///
/// Each paper-run owns its own workspace and sandbox; concurrency is
/// bounded by the configured `parallel`. Papers with an existing report
/// in the log directory are skipped unless `force` is set.
pub async fn evaluate_batch(
    runner: Arc<EvalRunner>,
    papers: Vec<Paper>,
    force: bool,
    cancel: CancellationToken,
) -> Vec<(String, Result<PaperReport, RunnerError>)> {
    let semaphore = Arc::new(Semaphore::new(runner.config().parallel.max(1)));
    let mut join_set = JoinSet::new();

    for paper in papers {
        if !force && PaperReport::exists(&runner.config().log_dir, &paper.paper_id) {
            warn!(
                "Skipping '{}': report already exists (use --force to rerun)",
                paper.paper_id
            );
            continue;
        }

        let runner = runner.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let result = runner.evaluate_paper(&paper, &cancel).await;
            (paper.paper_id, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(pair) => results.push(pair),
            Err(err) => warn!("Paper run task panicked: {err}"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}
