//! Run configuration and resource budgets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which sandbox backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain host processes inside the workspace.
    Local,
    /// One Docker container per paper-run.
    Docker,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Docker => write!(f, "docker"),
        }
    }
}

/// Resource budgets for one paper-run.
///
/// Message, token, and wall-clock ceilings are shared across the whole
/// run: an agent that burns the budget on early tasks forfeits later
/// ones. The execution timeout applies separately to each tool call and
/// is recoverable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RunBudgets {
    /// Maximum agent messages across the run.
    pub message_limit: u32,
    /// Maximum tokens across the run.
    pub token_limit: u64,
    /// Wall-clock ceiling for the whole run, in seconds.
    pub time_limit_secs: u64,
    /// Timeout for each individual tool call, in seconds.
    pub execution_timeout_secs: u64,
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self {
            message_limit: 500,
            token_limit: 200_000,
            time_limit_secs: 12_000,
            execution_timeout_secs: 6_000,
        }
    }
}

impl RunBudgets {
    /// Wall-clock ceiling as a duration.
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    /// Per-call execution timeout as a duration.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Full harness configuration for an evaluation invocation.
///
/// Loadable from a YAML (or JSON) config file; CLI arguments override
/// file values, never the other way around.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Model identifier handed to the agent.
    pub model: String,
    /// Directory of paper JSON files.
    pub papers_dir: PathBuf,
    /// Directory of per-paper task directories.
    pub tasks_dir: PathBuf,
    /// Directory of manuscript text files.
    pub manuscripts_dir: Option<PathBuf>,
    /// Base directory for per-paper workspaces.
    pub workspace_base: PathBuf,
    /// Directory evaluation logs and reports are written to.
    pub log_dir: PathBuf,
    /// Sandbox backend.
    pub backend: BackendKind,
    /// Container image override for the docker backend.
    pub image: Option<String>,
    /// Whether the backend may attach GPU resources.
    pub gpu: bool,
    /// Command line that launches the agent inside the sandbox.
    pub agent_cmd: String,
    /// Use masked manuscript text.
    pub masked: bool,
    /// Materialize datasets during preparation.
    pub download_data: bool,
    /// Install declared dependencies during preparation.
    pub install_deps: bool,
    /// Leave the sandbox alive after the run for inspection.
    pub keep_sandbox: bool,
    /// Maximum concurrent paper-runs in batch mode.
    pub parallel: usize,
    /// Resource budgets per paper-run.
    pub budgets: RunBudgets,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            papers_dir: PathBuf::from("./papers"),
            tasks_dir: PathBuf::from("./tasks"),
            manuscripts_dir: None,
            workspace_base: PathBuf::from("./workspace"),
            log_dir: PathBuf::from("./logs"),
            backend: BackendKind::Local,
            image: None,
            gpu: false,
            agent_cmd: "python -m baseagent".to_string(),
            masked: true,
            download_data: true,
            install_deps: true,
            keep_sandbox: false,
            parallel: 4,
            budgets: RunBudgets::default(),
        }
    }
}

impl HarnessConfig {
    /// Loads a config file. YAML is a superset of JSON, so both the
    /// native YAML format and legacy JSON experiment configs parse.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
