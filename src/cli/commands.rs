//! CLI command definitions for agent-validator.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::{IsolationKind, ValidatorConfig};
use crate::reward::Scorer;
use crate::runner::AgentRunner;
use crate::validator::{
    FilePeerSource, JsonlRewardSink, LogRewardSink, PeerSource, RewardSink, Validator,
};

/// Validator that fetches, runs and scores peer-submitted agents.
#[derive(Parser)]
#[command(name = "agent-validator")]
#[command(about = "Fetch peer-submitted agent repositories, run them against a task, and score them")]
#[command(version)]
#[command(
    long_about = "agent-validator clones a peer's repository, loads its agent.py entry point in a separate process, runs it against task.json and writes output.json.\n\nExample usage:\n  agent-validator run --repo https://github.com/org/agent --task task.json --output output.json\n  agent-validator cycle --peers peers.json --rewards rewards.jsonl"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "VALIDATOR_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Fetch one repository, run its agent against the task, and write the output.
    Run(RunArgs),

    /// Score peer responses without running anything.
    Score(ScoreArgs),

    /// Run the validator loop against a peer response file.
    Cycle(CycleArgs),
}

/// Arguments for `agent-validator run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Repository reference to clone.
    #[arg(short, long)]
    pub repo: String,

    /// Task input file (defaults to the configured task path).
    #[arg(short, long)]
    pub task: Option<PathBuf>,

    /// Output file (defaults to the configured output path).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Clone timeout in seconds.
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

    /// Execution timeout in seconds.
    #[arg(long)]
    pub exec_timeout: Option<u64>,

    /// Run the agent inside a Docker container.
    #[arg(long)]
    pub docker: bool,

    /// Print the outcome as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `agent-validator score`.
#[derive(Parser, Debug)]
pub struct ScoreArgs {
    /// JSON file with peer responses.
    #[arg(short, long)]
    pub peers: PathBuf,
}

/// Arguments for `agent-validator cycle`.
#[derive(Parser, Debug)]
pub struct CycleArgs {
    /// JSON file with peer responses, re-read every cycle.
    #[arg(short, long)]
    pub peers: PathBuf,

    /// Append per-cycle rewards to this JSONL file (otherwise they are only logged).
    #[arg(short, long)]
    pub rewards: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Stop after this many cycles.
    #[arg(long, conflicts_with = "once")]
    pub max_cycles: Option<u64>,

    /// Maximum pipelines running at once.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Print cycle reports as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = ValidatorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args).await,
        Commands::Score(args) => run_score_command(config, args).await,
        Commands::Cycle(args) => run_cycle_command(config, args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_pipeline_command(mut config: ValidatorConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(secs) = args.fetch_timeout {
        config.fetch_timeout_secs = secs;
    }
    if let Some(secs) = args.exec_timeout {
        config.exec_timeout_secs = secs;
    }
    if args.docker {
        config.isolation = IsolationKind::Docker;
    }
    config.validate()?;

    let task = args.task.unwrap_or_else(|| config.task_path.clone());
    let output = args.output.unwrap_or_else(|| config.output_path.clone());

    let runner = AgentRunner::new(config.run_config());
    let outcome = runner.run(&args.repo, &task, &output).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.is_success() {
        println!("Agent from {} succeeded; output written to {}", args.repo, output.display());
    } else {
        println!(
            "No result from {}: {} ({})",
            args.repo,
            outcome.error.as_deref().unwrap_or("unknown error"),
            outcome.error_kind.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ScoreOutput {
    uids: Vec<u16>,
    rewards: Vec<f32>,
}

async fn run_score_command(config: ValidatorConfig, args: ScoreArgs) -> anyhow::Result<()> {
    let candidates = FilePeerSource::new(&args.peers).query().await?;
    let responses: Vec<_> = candidates.iter().map(|c| c.response.clone()).collect();

    // Nothing is executed here, so only the reference itself can be scored.
    let scorer = Scorer::new(config.reward_prefix.clone(), Default::default());
    let output = ScoreOutput {
        uids: candidates.iter().map(|c| c.uid).collect(),
        rewards: scorer.score_all(&responses, &[]),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_cycle_command(mut config: ValidatorConfig, args: CycleArgs) -> anyhow::Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent_pipelines = concurrency;
    }
    config.validate()?;
    ensure_exists(&args.peers)?;

    let sink: Box<dyn RewardSink> = match &args.rewards {
        Some(path) => Box::new(JsonlRewardSink::new(path)),
        None => Box::new(LogRewardSink),
    };
    let max_cycles = if args.once { Some(1) } else { args.max_cycles };

    info!(
        peers = %args.peers.display(),
        concurrency = config.max_concurrent_pipelines,
        isolation = %config.isolation_mode(),
        "Starting validator"
    );

    let validator = Validator::new(config, Box::new(FilePeerSource::new(&args.peers)), sink);
    let reports = validator.run_forever(max_cycles).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(())
}

fn ensure_exists(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        return Err(anyhow::anyhow!("Peer file does not exist: {}", path.display()));
    }
    Ok(())
}
