//! Sandbox layer: isolated, resource-bounded execution environments.
//!
//! One sandbox per paper-run, never reused across papers. The
//! [`SandboxBackend`] trait abstracts the container runtime; the
//! [`manager::SandboxManager`] drives the full lifecycle (workspace
//! lock, dataset materialization, dependency installation, teardown)
//! independent of which backend is in use.

pub mod datasets;
pub mod docker;
pub mod local;
pub mod manager;
pub mod workspace;

pub use docker::DockerBackend;
pub use local::LocalBackend;
pub use manager::{PrepareOptions, SandboxHandle, SandboxManager};
pub use workspace::{Workspace, WorkspaceLock};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;

/// Specification for creating a backend sandbox for one paper.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    /// Paper the sandbox is created for.
    pub paper_id: String,
    /// Host workspace directory, mounted into the sandbox.
    pub workspace_dir: PathBuf,
    /// Container image (backends with no image concept ignore this).
    pub image: String,
    /// Whether GPU resources must be attached.
    pub needs_gpu: bool,
    /// Memory limit in MB.
    pub memory_limit_mb: u64,
    /// CPU limit (number of cores; 0 = unlimited).
    pub cpu_limit: f64,
    /// Environment variables for every command in the sandbox.
    pub env: Vec<(String, String)>,
}

/// Handle to a live backend sandbox.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    /// Unique sandbox identifier.
    pub id: String,
    /// Name of the backend that created this handle.
    pub backend: &'static str,
    /// Container id, when the backend is container-based.
    pub container_id: Option<String>,
    /// Workspace path as seen from inside the sandbox.
    pub workspace_dir: PathBuf,
    /// Environment applied per command (container backends bake the
    /// environment at creation instead).
    pub env: Vec<(String, String)>,
}

/// Outcome of one command execution inside a sandbox.
///
/// A timeout is reported here rather than as an error: it aborts only
/// the offending call and is relayed to the agent, not the run.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code (-1 when unknown or timed out).
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the call hit its execution timeout.
    pub timed_out: bool,
    /// Wall time of the call.
    pub duration: Duration,
}

impl ExecOutcome {
    /// Whether the command completed with exit code 0.
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Outcome for a call that hit its execution timeout.
    pub fn timeout(duration: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("execution timed out after {}s", duration.as_secs()),
            timed_out: true,
            duration,
        }
    }
}

/// A sandbox backend: the narrow interface the harness consumes from
/// the underlying container/sandboxing technology.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Backend name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Whether this backend can attach GPU resources. Papers requiring
    /// a GPU fail fast on a backend that cannot, rather than silently
    /// falling back to CPU.
    fn supports_gpu(&self) -> bool;

    /// Creates the isolated environment for one paper-run.
    async fn prepare(&self, spec: &BackendSpec) -> Result<BackendHandle, SandboxError>;

    /// Executes a command inside the sandbox with a per-call timeout.
    async fn execute(
        &self,
        handle: &BackendHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, SandboxError>;

    /// Destroys the environment. Must be safe to call on a sandbox that
    /// already exited.
    async fn teardown(&self, handle: &BackendHandle) -> Result<(), SandboxError>;
}
