use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use orchestrator_agents::config::RunConfig;
use orchestrator_agents::{AgentInvoker, BuildStatus, Orchestrator, RepoSource, RigBackend};

#[derive(Parser)]
#[command(name = "orchestrator", about = "Autonomous software-engineering build orchestrator")]
struct Cli {
    /// Base URL of the OpenAI-compatible completions endpoint backing every role.
    #[arg(long, env = "ORCHESTRATOR_ENDPOINT", default_value = "http://localhost:8080/v1")]
    endpoint: String,

    /// API key for the completions endpoint; most local endpoints ignore this.
    #[arg(long, env = "ORCHESTRATOR_API_KEY", default_value = "unused")]
    api_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute a goal against a repository end to end.
    Build {
        /// What the run should accomplish.
        goal: String,
        /// Path to a local repository, or a URL to clone.
        #[arg(long)]
        repo: String,
        /// Treat `--repo` as a remote URL to clone rather than a local path.
        #[arg(long)]
        remote: bool,
        /// Caller-supplied config overrides as `key=value` pairs (§6/§14).
        #[arg(long = "set", value_parser = parse_key_value)]
        overrides: Vec<(String, String)>,
    },
    /// Run only the Planning Pipeline and print the resulting plan.
    Plan {
        goal: String,
        #[arg(long)]
        repo: PathBuf,
    },
    /// Execute an already-produced plan (read from a JSON file) against a repository.
    Execute {
        #[arg(long)]
        repo: PathBuf,
        /// Path to a `PlanResult` serialized as JSON (e.g. from `plan --format json`).
        #[arg(long)]
        plan_file: PathBuf,
    },
    /// Resume a crashed or interrupted build from its last checkpoint.
    Resume {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        artifacts_dir: PathBuf,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let backend = RigBackend::new("default", &cli.endpoint, &cli.api_key).context("failed to build completions backend")?;
    let invoker = AgentInvoker::new(std::sync::Arc::new(backend));
    let orchestrator = Orchestrator::new(invoker);

    match cli.command {
        Command::Build { goal, repo, remote, overrides } => {
            let config = RunConfig::from_map(&overrides.into_iter().collect()).context("invalid --set override")?;
            let source = if remote { RepoSource::Remote(repo) } else { RepoSource::Local(PathBuf::from(repo)) };
            info!(%goal, "starting build");
            let result = orchestrator.build(&goal, source, config).await?;
            info!(status = ?result.status, phases = result.phase_breakdown.len(), debt = result.accumulated_debt.len(), "build finished");
            for phase in &result.phase_breakdown {
                println!("[{}] {}", phase.phase, phase.detail);
            }
            println!("status: {:?}", result.status);
            if !matches!(result.status, BuildStatus::Success) {
                std::process::exit(1);
            }
        }
        Command::Plan { goal, repo } => {
            let config = RunConfig::default();
            let plan = orchestrator.plan(&goal, &repo, &config).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Execute { repo, plan_file } => {
            let config = RunConfig::default();
            let raw = std::fs::read_to_string(&plan_file).with_context(|| format!("reading {}", plan_file.display()))?;
            let plan = serde_json::from_str(&raw).context("plan file is not a valid PlanResult")?;
            let state = orchestrator.execute(plan, &repo, &config).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Resume { repo, artifacts_dir } => {
            let result = orchestrator.resume_build(&repo, &artifacts_dir).await?;
            println!("status: {:?}", result.status);
            for phase in &result.phase_breakdown {
                println!("[{}] {}", phase.phase, phase.detail);
            }
        }
    }

    Ok(())
}
