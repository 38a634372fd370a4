//! Sandbox lifecycle manager.
//!
//! Drives the full preparation sequence for one paper-run — GPU gating,
//! workspace lock, dataset materialization, dependency installation —
//! and guarantees the reverse path on teardown. Preparation is
//! idempotent: completed downloads and satisfied dependency sets are
//! never redone on retry.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dataset::Paper;
use crate::error::{EnvironmentSetupError, ResourceUnavailableError, SandboxError};

use super::workspace::Workspace;
use super::{datasets, BackendHandle, BackendSpec, SandboxBackend};

/// Default container image for papers that do not need anything special.
const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// What preparation steps to perform.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    /// Materialize HuggingFace datasets into the workspace.
    pub download_data: bool,
    /// Install the paper's declared dependencies into the sandbox.
    pub install_deps: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            download_data: true,
            install_deps: true,
        }
    }
}

/// A fully prepared sandbox for one paper-run.
///
/// Owns the workspace lock; dropping the handle releases the lock, but
/// backend teardown must go through [`SandboxManager::teardown`] (or
/// [`SandboxManager::release`] to keep the sandbox for inspection).
#[derive(Debug)]
pub struct SandboxHandle {
    /// Run this sandbox belongs to.
    pub run_id: String,
    /// Paper this sandbox was prepared for.
    pub paper_id: String,
    /// The exclusively-held workspace.
    pub workspace: Workspace,
    /// Live backend sandbox.
    pub backend_handle: BackendHandle,
    released: bool,
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Sandbox {} for paper '{}' dropped without teardown",
                self.backend_handle.id, self.paper_id
            );
        }
    }
}

/// Creates, configures, and tears down sandboxes, independent of the
/// backend in use.
pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    http: reqwest::Client,
    image: String,
    memory_limit_mb: u64,
    cpu_limit: f64,
    install_timeout: Duration,
}

impl SandboxManager {
    /// Creates a manager over the given backend.
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
            image: DEFAULT_IMAGE.to_string(),
            memory_limit_mb: 32 * 1024,
            cpu_limit: 0.0,
            install_timeout: Duration::from_secs(1800),
        }
    }

    /// Sets the container image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the memory limit in MB.
    pub fn with_memory_limit(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Sets the CPU limit.
    pub fn with_cpu_limit(mut self, cores: f64) -> Self {
        self.cpu_limit = cores;
        self
    }

    /// Sets the per-package install timeout.
    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    /// The backend this manager drives.
    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Prepares a sandbox for `paper` under `<workspace_base>/<paper_id>/`.
    ///
    /// Fails fast before any work when the paper needs a GPU the backend
    /// cannot provide, or when another run holds the workspace lock.
    pub async fn prepare(
        &self,
        paper: &Paper,
        workspace_base: &std::path::Path,
        run_id: &str,
        opts: &PrepareOptions,
    ) -> Result<SandboxHandle, EnvironmentSetupError> {
        if paper.needs_gpu() && !self.backend.supports_gpu() {
            return Err(ResourceUnavailableError::GpuUnavailable {
                paper_id: paper.paper_id.clone(),
                backend: self.backend.name().to_string(),
            }
            .into());
        }

        let workspace = Workspace::acquire(workspace_base, &paper.paper_id, run_id)?;

        if opts.download_data {
            for descriptor in paper.huggingface_datasets() {
                datasets::materialize(&self.http, descriptor, &workspace.data_dir()).await?;
            }
        }

        let spec = BackendSpec {
            paper_id: paper.paper_id.clone(),
            workspace_dir: workspace.root().to_path_buf(),
            image: self.image.clone(),
            needs_gpu: paper.needs_gpu(),
            memory_limit_mb: self.memory_limit_mb,
            cpu_limit: self.cpu_limit,
            env: sandbox_env(),
        };
        let backend_handle = self.backend.prepare(&spec).await?;

        if opts.install_deps {
            let deps = &paper.execution_requirements.dependencies;
            if let Err(err) = self.install_dependencies(&backend_handle, &workspace, deps).await {
                // No partial environments: undo the backend sandbox before
                // reporting the failed package.
                if let Err(td) = self.backend.teardown(&backend_handle).await {
                    warn!("Teardown after failed install also failed: {}", td);
                }
                return Err(err);
            }
        }

        info!(
            "Sandbox {} ready for paper '{}'",
            backend_handle.id, paper.paper_id
        );

        Ok(SandboxHandle {
            run_id: run_id.to_string(),
            paper_id: paper.paper_id.clone(),
            workspace,
            backend_handle,
            released: false,
        })
    }

    /// Installs the paper's declared dependencies, one package at a
    /// time so a failure always names the offending package. Skipped
    /// entirely when the workspace's install manifest already records
    /// the same package set.
    async fn install_dependencies(
        &self,
        handle: &BackendHandle,
        workspace: &Workspace,
        dependencies: &[String],
    ) -> Result<(), EnvironmentSetupError> {
        if dependencies.is_empty() {
            return Ok(());
        }

        let mut wanted: Vec<String> = dependencies.to_vec();
        wanted.sort();

        let manifest_path = workspace.deps_manifest_path();
        if let Ok(contents) = fs::read_to_string(&manifest_path) {
            if let Ok(mut installed) = serde_json::from_str::<Vec<String>>(&contents) {
                installed.sort();
                if installed == wanted {
                    debug!("Dependencies already satisfied, skipping install");
                    return Ok(());
                }
            }
        }

        let user_base = handle.workspace_dir.join(".pip");
        for package in dependencies {
            info!("Installing dependency '{}'", package);
            let script = format!(
                "PYTHONUSERBASE={} python3 -m pip install --user --no-build-isolation '{}'",
                user_base.display(),
                package
            );
            let command = vec!["bash".to_string(), "-lc".to_string(), script];

            let outcome = self
                .backend
                .execute(handle, &command, self.install_timeout)
                .await
                .map_err(|e| EnvironmentSetupError::DependencyInstall {
                    package: package.clone(),
                    detail: e.to_string(),
                })?;

            if !outcome.is_success() {
                return Err(EnvironmentSetupError::DependencyInstall {
                    package: package.clone(),
                    detail: if outcome.timed_out {
                        outcome.stderr
                    } else {
                        tail(&outcome.stderr, 500)
                    },
                });
            }
        }

        fs::write(&manifest_path, serde_json::to_string(&wanted)?)?;
        Ok(())
    }

    /// Tears the sandbox down and releases the workspace.
    pub async fn teardown(&self, mut handle: SandboxHandle) -> Result<(), SandboxError> {
        handle.released = true;
        info!(
            "Tearing down sandbox {} for paper '{}'",
            handle.backend_handle.id, handle.paper_id
        );
        self.backend.teardown(&handle.backend_handle).await
    }

    /// Releases the workspace but leaves the backend sandbox alive for
    /// inspection.
    pub fn release(&self, mut handle: SandboxHandle) {
        handle.released = true;
        info!(
            "Keeping sandbox {} for inspection (workspace {})",
            handle.backend_handle.id,
            handle.workspace.root().display()
        );
    }
}

/// Environment every sandbox command runs with: writable caches under
/// /tmp so unprivileged agents do not trip over read-only homes.
fn sandbox_env() -> Vec<(String, String)> {
    vec![
        ("HOME".to_string(), "/tmp".to_string()),
        ("XDG_CONFIG_HOME".to_string(), "/tmp/.config".to_string()),
        ("XDG_CACHE_HOME".to_string(), "/tmp/.cache".to_string()),
        ("MPLCONFIGDIR".to_string(), "/tmp/.matplotlib".to_string()),
    ]
}

/// Last `max` bytes of a string, for error details.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ExecutionRequirements, Paper};
    use crate::sandbox::{ExecOutcome, LocalBackend};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn make_paper(paper_id: &str, needs_gpu: bool, deps: &[&str]) -> Paper {
        Paper {
            paper_id: paper_id.to_string(),
            title: String::new(),
            abstract_text: String::new(),
            publication_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            paper_link: String::new(),
            code_available: false,
            code_link: None,
            source: String::new(),
            execution_requirements: ExecutionRequirements {
                code_language: vec![],
                dependencies: deps.iter().map(|s| s.to_string()).collect(),
                needs_gpu,
            },
            datasets: vec![],
            other_instructions: None,
            full_text: None,
            tasks: Default::default(),
        }
    }

    /// Backend that records executions and optionally fails them.
    #[derive(Default)]
    struct MockBackend {
        fail_exec: bool,
        execs: AtomicUsize,
        torn_down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SandboxBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn supports_gpu(&self) -> bool {
            false
        }

        async fn prepare(&self, spec: &BackendSpec) -> Result<BackendHandle, SandboxError> {
            Ok(BackendHandle {
                id: "mock-sandbox".to_string(),
                backend: self.name(),
                container_id: None,
                workspace_dir: spec.workspace_dir.clone(),
                env: vec![],
            })
        }

        async fn execute(
            &self,
            _handle: &BackendHandle,
            _command: &[String],
            _timeout: Duration,
        ) -> Result<ExecOutcome, SandboxError> {
            self.execs.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutcome {
                exit_code: if self.fail_exec { 1 } else { 0 },
                stdout: String::new(),
                stderr: if self.fail_exec {
                    "no matching distribution".to_string()
                } else {
                    String::new()
                },
                timed_out: false,
                duration: Duration::from_millis(1),
            })
        }

        async fn teardown(&self, _handle: &BackendHandle) -> Result<(), SandboxError> {
            self.torn_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_gpu_paper_fails_fast_on_cpu_backend() {
        let base = TempDir::new().unwrap();
        let manager = SandboxManager::new(Arc::new(LocalBackend::new()));
        let paper = make_paper("gpu_paper", true, &[]);

        let err = manager
            .prepare(&paper, base.path(), "run-1", &PrepareOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnvironmentSetupError::Resource(ResourceUnavailableError::GpuUnavailable { .. })
        ));
        // Fail-fast: no workspace lock left behind.
        assert!(!base.path().join("gpu_paper").join(".run.lock").exists());
    }

    #[tokio::test]
    async fn test_concurrent_prepare_same_paper_fails_fast() {
        let base = TempDir::new().unwrap();
        let manager = SandboxManager::new(Arc::new(LocalBackend::new()));
        let paper = make_paper("alpha", false, &[]);
        let opts = PrepareOptions {
            download_data: false,
            install_deps: false,
        };

        let held = manager
            .prepare(&paper, base.path(), "run-1", &opts)
            .await
            .unwrap();
        let err = manager
            .prepare(&paper, base.path(), "run-2", &opts)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnvironmentSetupError::Resource(ResourceUnavailableError::WorkspaceLocked { .. })
        ));

        manager.teardown(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_install_names_package_and_tears_down() {
        let base = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend {
            fail_exec: true,
            ..Default::default()
        });
        let manager = SandboxManager::new(backend.clone());
        let paper = make_paper("alpha", false, &["nonexistent-package==9.9"]);

        let err = manager
            .prepare(&paper, base.path(), "run-1", &PrepareOptions::default())
            .await
            .unwrap_err();
        match err {
            EnvironmentSetupError::DependencyInstall { package, .. } => {
                assert_eq!(package, "nonexistent-package==9.9");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(backend.torn_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent_for_satisfied_deps() {
        let base = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::default());
        let manager = SandboxManager::new(backend.clone());
        let paper = make_paper("alpha", false, &["numpy", "astropy"]);

        let first = manager
            .prepare(&paper, base.path(), "run-1", &PrepareOptions::default())
            .await
            .unwrap();
        assert_eq!(backend.execs.load(Ordering::SeqCst), 2);
        manager.teardown(first).await.unwrap();

        // Second preparation: the install manifest satisfies both
        // packages, so no commands run at all.
        let second = manager
            .prepare(&paper, base.path(), "run-2", &PrepareOptions::default())
            .await
            .unwrap();
        assert_eq!(backend.execs.load(Ordering::SeqCst), 2);
        assert_eq!(second.paper_id, "alpha");
        manager.teardown(second).await.unwrap();
    }

    #[test]
    fn test_tail_truncates() {
        assert_eq!(tail("short", 10), "short");
        let long = "x".repeat(600);
        let t = tail(&long, 500);
        assert!(t.starts_with("..."));
        assert_eq!(t.len(), 503);
    }
}
