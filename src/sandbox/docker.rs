//! Docker sandbox backend using the bollard crate.
//!
//! One long-lived container per paper-run: the container idles on
//! `tail -f /dev/null` with the workspace bind-mounted at `/workspace`,
//! and every agent tool call executes through the Docker exec API with
//! its own timeout.

use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;

use super::{BackendHandle, BackendSpec, ExecOutcome, SandboxBackend};

/// Seconds to wait for a graceful container stop before SIGKILL.
const STOP_GRACE_SECS: i64 = 10;

/// Docker-based sandbox backend.
pub struct DockerBackend {
    docker: Docker,
    gpu_enabled: bool,
}

impl DockerBackend {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::BackendUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self {
            docker,
            gpu_enabled: false,
        })
    }

    /// Enables GPU attachment for prepared sandboxes.
    pub fn with_gpu(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }

    /// Pulls the image if it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::CreateFailed(format!("Failed to pull image: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn supports_gpu(&self) -> bool {
        self.gpu_enabled
    }

    async fn prepare(&self, spec: &BackendSpec) -> Result<BackendHandle, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let name = format!("repro-bench-{}-{}", spec.paper_id, Uuid::new_v4());

        let mut device_requests = None;
        if spec.needs_gpu {
            device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
        }

        let host_config = HostConfig {
            memory: Some((spec.memory_limit_mb * 1024 * 1024) as i64),
            nano_cpus: if spec.cpu_limit > 0.0 {
                Some((spec.cpu_limit * 1e9) as i64)
            } else {
                None
            },
            binds: Some(vec![format!("{}:/workspace", spec.workspace_dir.display())]),
            device_requests,
            init: Some(true),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: Some("/workspace".to_string()),
            host_config: Some(host_config),
            tty: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("Failed to start container: {e}")))?;

        debug!("Container {} up for paper '{}'", name, spec.paper_id);

        Ok(BackendHandle {
            id: name,
            backend: self.name(),
            container_id: Some(response.id),
            workspace_dir: "/workspace".into(),
            // Environment is baked into the container.
            env: Vec::new(),
        })
    }

    async fn execute(
        &self,
        handle: &BackendHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, SandboxError> {
        let container_id = handle
            .container_id
            .as_deref()
            .ok_or_else(|| SandboxError::ExecFailed("handle has no container".to_string()))?;

        let exec_options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            working_dir: Some(handle.workspace_dir.to_string_lossy().to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_options)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to create exec: {e}")))?;

        let start = Instant::now();
        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to start exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(SandboxError::ExecFailed(format!(
                                "Error reading output: {e}"
                            )));
                        }
                    }
                }
                Ok(())
            };

            match tokio::time::timeout(timeout, drain).await {
                Ok(result) => result?,
                Err(_) => {
                    // The exec keeps running server-side; the container is
                    // torn down at the end of the run regardless.
                    warn!(
                        "Exec in {} timed out after {}s",
                        handle.id,
                        timeout.as_secs()
                    );
                    return Ok(ExecOutcome::timeout(timeout));
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to inspect exec: {e}")))?;

        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
            timed_out: false,
            duration: start.elapsed(),
        })
    }

    async fn teardown(&self, handle: &BackendHandle) -> Result<(), SandboxError> {
        let Some(container_id) = handle.container_id.as_deref() else {
            return Ok(());
        };

        let stop = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await;
        if let Err(e) = stop {
            debug!("Stop of {} reported: {}", handle.id, e);
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(SandboxError::TeardownFailed(format!(
                "Failed to remove container {}: {e}",
                handle.id
            ))),
        }
    }
}
