//! Local-process sandbox backend.
//!
//! Runs commands directly on the host inside the paper workspace. No
//! container isolation; intended for trusted environments and tests.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SandboxError;

use super::{BackendHandle, BackendSpec, ExecOutcome, SandboxBackend};

/// Sandbox backend that executes commands as local processes.
#[derive(Debug, Default)]
pub struct LocalBackend {
    gpu_available: bool,
}

impl LocalBackend {
    /// Creates a local backend with no GPU.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that the host has a usable GPU.
    pub fn with_gpu(mut self, available: bool) -> Self {
        self.gpu_available = available;
        self
    }
}

#[async_trait::async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_gpu(&self) -> bool {
        self.gpu_available
    }

    async fn prepare(&self, spec: &BackendSpec) -> Result<BackendHandle, SandboxError> {
        if !spec.workspace_dir.exists() {
            return Err(SandboxError::CreateFailed(format!(
                "workspace '{}' does not exist",
                spec.workspace_dir.display()
            )));
        }

        let id = format!("repro-bench-{}-{}", spec.paper_id, Uuid::new_v4());
        debug!("Local sandbox {} rooted at {}", id, spec.workspace_dir.display());

        Ok(BackendHandle {
            id,
            backend: self.name(),
            container_id: None,
            workspace_dir: spec.workspace_dir.clone(),
            env: spec.env.clone(),
        })
    }

    async fn execute(
        &self,
        handle: &BackendHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, SandboxError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SandboxError::ExecFailed("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&handle.workspace_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &handle.env {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to spawn '{program}': {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutcome {
                exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
                duration: start.elapsed(),
            }),
            Ok(Err(e)) => Err(SandboxError::ExecFailed(format!(
                "Failed to wait for '{program}': {e}"
            ))),
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                warn!(
                    "Local exec '{}' timed out after {}s",
                    program,
                    timeout.as_secs()
                );
                Ok(ExecOutcome::timeout(timeout))
            }
        }
    }

    async fn teardown(&self, _handle: &BackendHandle) -> Result<(), SandboxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn spec_for(dir: &std::path::Path) -> BackendSpec {
        BackendSpec {
            paper_id: "alpha".to_string(),
            workspace_dir: dir.to_path_buf(),
            image: String::new(),
            needs_gpu: false,
            memory_limit_mb: 0,
            cpu_limit: 0.0,
            env: vec![("REPRO_TEST_VAR".to_string(), "42".to_string())],
        }
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let handle = backend.prepare(&spec_for(temp.path())).await.unwrap();

        let outcome = backend
            .execute(
                &handle,
                &["sh".to_string(), "-c".to_string(), "echo $REPRO_TEST_VAR".to_string()],
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let handle = backend.prepare(&spec_for(temp.path())).await.unwrap();

        let outcome = backend
            .execute(
                &handle,
                &["sleep".to_string(), "5".to_string()],
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_prepare_rejects_missing_workspace() {
        let backend = LocalBackend::new();
        let spec = spec_for(&PathBuf::from("/nonexistent/workspace/path"));
        assert!(backend.prepare(&spec).await.is_err());
    }

    #[test]
    fn test_gpu_flag() {
        assert!(!LocalBackend::new().supports_gpu());
        assert!(LocalBackend::new().with_gpu(true).supports_gpu());
    }
}
