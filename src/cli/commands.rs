//! CLI command definitions for repro-bench.
//!
//! A config file (`--config`, YAML or JSON) supplies defaults; CLI
//! arguments override file values, never the other way around.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dataset::{LoadReport, PaperLoader};
use crate::resolver;
use crate::runner::{
    evaluate_batch, BackendKind, CommandAgent, EvalRunner, HarnessConfig, PaperReport,
};
use crate::sandbox::{DockerBackend, LocalBackend, SandboxBackend, SandboxManager};

/// Evaluation harness for research-paper replication tasks.
#[derive(Parser)]
#[command(name = "repro-bench")]
#[command(about = "Run AI agents on paper replication tasks and grade their answers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Validate paper and task specifications without running anything.
    Validate(ValidateArgs),

    /// Evaluate a single paper.
    Run(Box<RunArgs>),

    /// Evaluate all matching papers in parallel across sandboxes.
    Batch(Box<BatchArgs>),
}

/// Arguments for `repro-bench validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Directory of paper JSON files.
    #[arg(long, default_value = "./papers")]
    pub papers_dir: PathBuf,

    /// Directory of per-paper task directories.
    #[arg(long, default_value = "./tasks")]
    pub tasks_dir: PathBuf,

    /// Validate only this paper.
    #[arg(short, long)]
    pub paper_id: Option<String>,
}

/// Shared evaluation arguments.
#[derive(clap::Args, Debug, Default)]
pub struct EvalArgs {
    /// Model identifier handed to the agent.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Directory for evaluation logs and reports.
    #[arg(short, long)]
    pub log_dir: Option<PathBuf>,

    /// Config file (YAML or JSON) supplying defaults for unset args.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory of paper JSON files.
    #[arg(long)]
    pub papers_dir: Option<PathBuf>,

    /// Directory of per-paper task directories.
    #[arg(long)]
    pub tasks_dir: Option<PathBuf>,

    /// Directory of manuscript text files.
    #[arg(long)]
    pub manuscripts_dir: Option<PathBuf>,

    /// Base directory for per-paper workspaces.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Sandbox backend.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Container image for the docker backend.
    #[arg(long)]
    pub image: Option<String>,

    /// Allow the backend to attach GPU resources.
    #[arg(long)]
    pub gpu: bool,

    /// Command line that launches the agent inside the sandbox.
    #[arg(long)]
    pub agent_cmd: Option<String>,

    /// Maximum agent messages per paper-run.
    #[arg(long)]
    pub message_limit: Option<u32>,

    /// Maximum tokens per paper-run.
    #[arg(long)]
    pub token_limit: Option<u64>,

    /// Wall-clock limit per paper-run, in seconds.
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Timeout per tool call, in seconds.
    #[arg(long)]
    pub execution_timeout: Option<u64>,

    /// Use unmasked manuscript text.
    #[arg(long)]
    pub no_masking: bool,

    /// Skip dataset materialization.
    #[arg(long)]
    pub no_download: bool,

    /// Skip dependency installation.
    #[arg(long)]
    pub no_install: bool,

    /// Leave sandboxes alive after runs for inspection.
    #[arg(long)]
    pub keep_sandbox: bool,
}

/// Arguments for `repro-bench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Paper to evaluate.
    #[arg(short, long)]
    pub paper_id: String,

    #[command(flatten)]
    pub eval: EvalArgs,
}

/// Arguments for `repro-bench batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Metadata filters, `field=value` (e.g. `source=expert`).
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Maximum concurrent paper-runs.
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Rerun papers that already have a report in the log directory.
    #[arg(long)]
    pub force: bool,

    #[command(flatten)]
    pub eval: EvalArgs,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate(args) => validate(args),
        Commands::Run(args) => run_single(*args).await,
        Commands::Batch(args) => run_batch(*args).await,
    }
}

/// Folds CLI overrides into the config-file (or default) values.
fn build_config(args: &EvalArgs) -> anyhow::Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = log_dir.clone();
    }
    if let Some(dir) = &args.papers_dir {
        config.papers_dir = dir.clone();
    }
    if let Some(dir) = &args.tasks_dir {
        config.tasks_dir = dir.clone();
    }
    if let Some(dir) = &args.manuscripts_dir {
        config.manuscripts_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.workspace {
        config.workspace_base = dir.clone();
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(image) = &args.image {
        config.image = Some(image.clone());
    }
    if args.gpu {
        config.gpu = true;
    }
    if let Some(cmd) = &args.agent_cmd {
        config.agent_cmd = cmd.clone();
    }
    if let Some(limit) = args.message_limit {
        config.budgets.message_limit = limit;
    }
    if let Some(limit) = args.token_limit {
        config.budgets.token_limit = limit;
    }
    if let Some(limit) = args.time_limit {
        config.budgets.time_limit_secs = limit;
    }
    if let Some(timeout) = args.execution_timeout {
        config.budgets.execution_timeout_secs = timeout;
    }
    if args.no_masking {
        config.masked = false;
    }
    if args.no_download {
        config.download_data = false;
    }
    if args.no_install {
        config.install_deps = false;
    }
    if args.keep_sandbox {
        config.keep_sandbox = true;
    }

    if config.model.is_empty() {
        bail!("--model is required (via CLI or config file)");
    }
    Ok(config)
}

/// Builds the runner stack for a config.
fn build_runner(config: HarnessConfig) -> anyhow::Result<EvalRunner> {
    let backend: Arc<dyn SandboxBackend> = match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new().with_gpu(config.gpu)),
        BackendKind::Docker => Arc::new(DockerBackend::new()?.with_gpu(config.gpu)),
    };

    let mut manager = SandboxManager::new(backend);
    if let Some(image) = &config.image {
        manager = manager.with_image(image);
    }

    let agent = Arc::new(CommandAgent::new(&config.agent_cmd));
    Ok(EvalRunner::new(manager, agent, config))
}

/// Loads papers for a config.
fn load_papers(config: &HarnessConfig, paper_ids: Option<Vec<String>>) -> LoadReport {
    let mut loader = PaperLoader::new(&config.papers_dir, &config.tasks_dir)
        .with_masked(config.masked);
    if let Some(dir) = &config.manuscripts_dir {
        loader = loader.with_manuscripts_dir(dir);
    }
    if let Some(ids) = paper_ids {
        loader = loader.with_paper_ids(ids);
    }
    loader.load()
}

/// Cancellation token wired to Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight runs");
            trigger.cancel();
        }
    });
    cancel
}

fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let mut loader = PaperLoader::new(&args.papers_dir, &args.tasks_dir);
    if let Some(paper_id) = args.paper_id {
        loader = loader.with_paper_ids(vec![paper_id]);
    }
    let report = loader.load();

    for (paper_id, paper) in &report.papers {
        match resolver::resolve(paper) {
            Ok(order) => {
                let ids: Vec<&str> = order.iter().map(|t| t.task_id.as_str()).collect();
                println!("{paper_id}: OK ({} task(s): {})", order.len(), ids.join(", "));
            }
            Err(err) => {
                println!("{paper_id}: CYCLE - {err}");
                error!("{err}");
            }
        }
    }
    for (paper_id, err) in &report.failures {
        println!("{paper_id}: INVALID - {err}");
    }

    let cycles = report
        .papers
        .values()
        .filter(|p| resolver::resolve(p).is_err())
        .count();
    if !report.failures.is_empty() || cycles > 0 {
        bail!(
            "{} paper(s) failed validation",
            report.failures.len() + cycles
        );
    }
    info!("All {} paper(s) valid", report.papers.len());
    Ok(())
}

async fn run_single(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args.eval)?;
    let report = load_papers(&config, Some(vec![args.paper_id.clone()]));

    for (paper_id, err) in &report.failures {
        error!("Paper '{}' failed to load: {}", paper_id, err);
    }
    let Some(paper) = report.papers.get(&args.paper_id) else {
        bail!("paper '{}' not found or failed to load", args.paper_id);
    };

    let runner = build_runner(config)?;
    let cancel = cancel_on_ctrl_c();
    let paper_report = runner.evaluate_paper(paper, &cancel).await?;

    print_summary(&paper_report);
    Ok(())
}

async fn run_batch(args: BatchArgs) -> anyhow::Result<()> {
    let mut config = build_config(&args.eval)?;
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }

    let mut loader = PaperLoader::new(&config.papers_dir, &config.tasks_dir)
        .with_masked(config.masked);
    if let Some(dir) = &config.manuscripts_dir {
        loader = loader.with_manuscripts_dir(dir);
    }
    for filter in &args.filters {
        let Some((field, value)) = filter.split_once('=') else {
            bail!("invalid filter '{filter}', expected field=value");
        };
        loader = loader.with_filter(field, value);
    }
    let load_report = loader.load();
    for (paper_id, err) in &load_report.failures {
        warn!("Paper '{}' rejected at load: {}", paper_id, err);
    }
    if load_report.papers.is_empty() {
        info!("No papers matched; nothing to run");
        return Ok(());
    }

    let total_tasks: usize = load_report.papers.values().map(|p| p.tasks.len()).sum();
    info!(
        "Evaluating {} paper(s), {} task(s) total",
        load_report.papers.len(),
        total_tasks
    );

    let runner = Arc::new(build_runner(config)?);
    let cancel = cancel_on_ctrl_c();
    let papers: Vec<_> = load_report.papers.into_values().collect();
    let results = evaluate_batch(runner, papers, args.force, cancel).await;

    let mut failed = 0usize;
    for (paper_id, result) in &results {
        match result {
            Ok(report) => print_summary(report),
            Err(err) => {
                failed += 1;
                error!("Paper '{}' run failed: {}", paper_id, err);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} paper run(s) failed");
    }
    Ok(())
}

fn print_summary(report: &PaperReport) {
    println!(
        "{}: {}/{} graded task(s) passed ({:.0}%), {} skipped, {} not attempted",
        report.paper_id,
        report.summary.passed,
        report.summary.graded,
        report.summary.pass_rate * 100.0,
        report.summary.skipped,
        report.summary.not_attempted,
    );
}
