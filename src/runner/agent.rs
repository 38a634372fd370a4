//! Agent drivers: the narrow interface to the agent-execution framework.
//!
//! A driver accepts a model identifier, a prompt, and a live sandbox
//! handle, and returns either a structured final answer or an
//! indication that none was produced, along with the usage it consumed
//! against the run's shared budgets.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::sandbox::{BackendHandle, SandboxBackend};
use crate::utils::extract_json;

/// File the agent writes its final structured answer to.
pub const SUBMISSION_FILENAME: &str = "submission.json";

/// Optional file an agent scaffold writes to report its usage.
const USAGE_FILENAME: &str = ".usage.json";

/// One task attempt handed to a driver.
pub struct TaskRequest<'a> {
    /// Paper under evaluation.
    pub paper_id: &'a str,
    /// Task under evaluation.
    pub task_id: &'a str,
    /// Model identifier for the agent.
    pub model: &'a str,
    /// System prompt for the run.
    pub system_prompt: &'a str,
    /// Composed paper + task prompt.
    pub prompt: &'a str,
    /// Backend to execute tool calls through.
    pub backend: &'a dyn SandboxBackend,
    /// Live sandbox for this paper-run.
    pub handle: &'a BackendHandle,
    /// Workspace root on the host (for writing prompts and reading the
    /// submission; the sandbox sees the same directory at its own path).
    pub workspace_host: &'a Path,
    /// Timeout for each tool call inside the sandbox.
    pub execution_timeout: Duration,
    /// Messages left in the run's shared budget.
    pub remaining_messages: u32,
    /// Tokens left in the run's shared budget.
    pub remaining_tokens: u64,
    /// Wall-clock time left in the run.
    pub remaining_time: Duration,
}

/// Result of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskAttempt {
    /// Final structured answer, absent when none was produced.
    pub answer: Option<Value>,
    /// Messages consumed by the attempt.
    pub messages_used: u32,
    /// Tokens consumed by the attempt.
    pub tokens_used: u64,
}

/// The agent-invocation interface consumed by the runner.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &str;

    /// Runs the agent on one task inside the sandbox.
    async fn attempt(&self, request: TaskRequest<'_>) -> Result<TaskAttempt, AgentError>;
}

/// Usage an external scaffold may report back.
#[derive(Debug, Default, Deserialize)]
struct ReportedUsage {
    #[serde(default)]
    messages: u32,
    #[serde(default)]
    tokens: u64,
}

/// Driver that launches an external agent command inside the sandbox.
///
/// Contract with the scaffold: the composed prompt is at `prompt.md` in
/// the workspace root, the model id is in `$REPRO_MODEL`, and the final
/// answer goes to `submission.json`. A scaffold that tracks its own
/// usage may write `.usage.json` (`{"messages": .., "tokens": ..}`);
/// otherwise the attempt counts as one message.
pub struct CommandAgent {
    command: String,
}

impl CommandAgent {
    /// Creates a driver around an agent launch command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentDriver for CommandAgent {
    fn name(&self) -> &str {
        "command"
    }

    async fn attempt(&self, request: TaskRequest<'_>) -> Result<TaskAttempt, AgentError> {
        let prompt_path = request.workspace_host.join("prompt.md");
        fs::write(
            &prompt_path,
            format!("{}\n\n---\n\n{}", request.system_prompt, request.prompt),
        )?;

        // A stale submission from an earlier task must not be read back
        // as this task's answer.
        let submission_path = request.workspace_host.join(SUBMISSION_FILENAME);
        let _ = fs::remove_file(&submission_path);
        let usage_path = request.workspace_host.join(USAGE_FILENAME);
        let _ = fs::remove_file(&usage_path);

        let script = format!("REPRO_MODEL='{}' {} prompt.md", request.model, self.command);
        let command = vec!["bash".to_string(), "-lc".to_string(), script];
        let timeout = request.execution_timeout.min(request.remaining_time);

        let outcome = request
            .backend
            .execute(request.handle, &command, timeout)
            .await?;

        if outcome.timed_out {
            warn!(
                "Agent command for task '{}' hit the execution timeout",
                request.task_id
            );
        } else if !outcome.is_success() {
            debug!(
                "Agent command for task '{}' exited {}",
                request.task_id, outcome.exit_code
            );
        }

        // Prefer the submission file; fall back to JSON in stdout.
        let answer = match fs::read_to_string(&submission_path) {
            Ok(contents) => extract_json(&contents),
            Err(_) => extract_json(&outcome.stdout),
        };

        let usage: ReportedUsage = fs::read_to_string(&usage_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(TaskAttempt {
            answer,
            messages_used: usage.messages.max(1),
            tokens_used: usage.tokens,
        })
    }
}

/// Driver that replays canned answers; for tests and dry runs.
pub struct ScriptedAgent {
    answers: HashMap<String, Value>,
    messages_per_task: u32,
    tokens_per_task: u64,
}

impl ScriptedAgent {
    /// Creates a driver that answers from the given map.
    pub fn new(answers: HashMap<String, Value>) -> Self {
        Self {
            answers,
            messages_per_task: 1,
            tokens_per_task: 0,
        }
    }

    /// Sets the usage each attempt reports.
    pub fn with_usage(mut self, messages: u32, tokens: u64) -> Self {
        self.messages_per_task = messages;
        self.tokens_per_task = tokens;
        self
    }
}

#[async_trait]
impl AgentDriver for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn attempt(&self, request: TaskRequest<'_>) -> Result<TaskAttempt, AgentError> {
        Ok(TaskAttempt {
            answer: self.answers.get(request.task_id).cloned(),
            messages_used: self.messages_per_task,
            tokens_used: self.tokens_per_task,
        })
    }
}
