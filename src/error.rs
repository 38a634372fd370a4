//! Error types for repro-bench operations.
//!
//! Defines error types for the major subsystems:
//! - Paper/task specification loading and validation
//! - Task dependency resolution
//! - Sandbox and workspace lifecycle
//! - Agent invocation
//! - Evaluation runs
//!
//! Grading outcomes (`structure_mismatch`, `no_answer`, `budget_exhausted`,
//! `unmet_dependency`) are deliberately *not* errors: the grading engine
//! always returns a verdict so a batch pass completes even with broken
//! agent output. See [`crate::grading::VerdictReason`].

use thiserror::Error;

/// Errors raised while loading paper/task specifications.
///
/// All of these are detected eagerly at load time, before any agent run
/// is spent on a malformed specification. A schema error aborts loading
/// of the single paper it concerns; batch loading isolates it.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Task '{task_id}': tolerance shape does not mirror expected_output: {reason}")]
    ToleranceShapeMismatch { task_id: String, reason: String },

    #[error("Duplicate task '{task_id}' in paper '{paper_id}'")]
    DuplicateTask { paper_id: String, task_id: String },

    #[error("Task '{task_id}' declares unknown parent '{parent_id}'")]
    UnknownParent { task_id: String, parent_id: String },

    #[error("Task '{task_id}': difficulty {difficulty} out of range (must be 1-10)")]
    InvalidDifficulty { task_id: String, difficulty: i64 },

    #[error("Task file '{path}' does not belong to paper '{paper_id}' (declares '{declared}')")]
    PaperMismatch {
        path: String,
        paper_id: String,
        declared: String,
    },

    #[error("Paper '{0}' not found")]
    PaperNotFound(String),

    #[error("Failed to parse '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A cycle in the parent graph of a paper's tasks.
///
/// The cycle is reported as the task ids along the loop, with the first
/// id repeated at the end.
#[derive(Debug, Error)]
#[error("Dependency cycle in paper '{paper_id}': {}", .cycle.join(" -> "))]
pub struct DependencyCycleError {
    /// Paper whose task graph contains the cycle.
    pub paper_id: String,
    /// Task ids along the cycle, first repeated last.
    pub cycle: Vec<String>,
}

/// Fast-fail resource errors. Never silently degraded: a GPU paper on a
/// CPU-only backend would produce numbers the tolerances were not tuned
/// for, and a shared workspace would corrupt both runs.
#[derive(Debug, Error)]
pub enum ResourceUnavailableError {
    #[error("Paper '{paper_id}' requires a GPU but backend '{backend}' has no GPU support")]
    GpuUnavailable { paper_id: String, backend: String },

    #[error("Workspace '{path}' is locked by another run ({holder})")]
    WorkspaceLocked { path: String, holder: String },
}

/// Errors during sandbox preparation for a paper.
///
/// Fatal for that paper's run only; other papers in a batch proceed.
#[derive(Debug, Error)]
pub enum EnvironmentSetupError {
    #[error("Failed to install dependency '{package}': {detail}")]
    DependencyInstall { package: String, detail: String },

    #[error("Failed to materialize dataset '{dataset}': {detail}")]
    DatasetDownload { dataset: String, detail: String },

    #[error("Workspace setup failed: {0}")]
    Workspace(String),

    #[error(transparent)]
    Resource(#[from] ResourceUnavailableError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from sandbox backends.
///
/// A tool-call timeout is *not* represented here: backends report it via
/// [`crate::sandbox::ExecOutcome::timed_out`] so the runner can relay it
/// to the agent as a recoverable tool error.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Failed to create sandbox: {0}")]
    CreateFailed(String),

    #[error("Execution failed: {0}")]
    ExecFailed(String),

    #[error("Teardown failed: {0}")]
    TeardownFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from agent drivers.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent not available: {0}")]
    NotAvailable(String),

    #[error("Agent invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a single paper's evaluation run.
///
/// Teardown is guaranteed to have run by the time one of these
/// propagates out of the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Cycle(#[from] DependencyCycleError),

    #[error("Environment setup failed: {0}")]
    Setup(#[from] EnvironmentSetupError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
