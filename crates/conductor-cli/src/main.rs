use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use conductor_core::TaskId;
use conductor_graph::SpecDocument;
use conductor_ledger::{FileLedger, LedgerStore};
use conductor_orchestrator::{
    CompletionRecord, FileSignalChannel, Orchestrator, OrchestratorConfig, RunReport, RunStore,
    WorkerReport,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor — Multi-agent task orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// State directory (overrides config)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Decompose a spec document into tasks and run loops
    Start {
        /// Spec document (.toml or .json)
        spec: PathBuf,
        /// Number of loops to run (defaults to max_loops)
        #[arg(short, long)]
        loops: Option<u32>,
    },
    /// Resume the current run and run more loops
    Loop {
        /// Number of loops to run
        #[arg(short, default_value_t = 1)]
        n: u32,
    },
    /// Show the task graph state
    Status {
        /// Print the task queue as markdown
        #[arg(long)]
        markdown: bool,
    },
    /// Show ledger metrics
    Metrics {
        /// Print JSON instead of markdown
        #[arg(long)]
        json: bool,
        /// Aggregate across all runs
        #[arg(long)]
        history: bool,
        /// Run to summarize (defaults to the current run)
        #[arg(long)]
        run: Option<String>,
    },
    /// Ask a running coordinator to stop after the current dispatches
    Abort,
    /// Signal completion of a worker attempt
    Signal {
        task: String,
        attempt: uuid::Uuid,
        /// Worker report (JSON)
        report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return init(&cli.config, force).await;
    }

    let config = load_config(&cli.config, cli.state_dir.clone()).await?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Start { spec, loops } => {
            let spec = SpecDocument::load(&spec)
                .await
                .with_context(|| format!("failed to load spec {}", spec.display()))?;
            let loops = loops.unwrap_or(config.max_loops);
            let orchestrator = Orchestrator::builder(config).build().await?;
            let run = orchestrator.start_run(&spec).await?;
            info!(run_id = %run.run_id, spec = %run.spec_name, "Run started");
            finish(orchestrator.run_loops(loops).await?)
        }
        Commands::Loop { n } => {
            let orchestrator = Orchestrator::builder(config).build().await?;
            orchestrator.clear_abort().await?;
            let recovered = orchestrator.resume().await?;
            if recovered > 0 {
                info!(recovered, "Recovered in-flight attempts");
            }
            finish(orchestrator.run_loops(n).await?)
        }
        Commands::Status { markdown } => {
            let orchestrator = Orchestrator::builder(config).build().await?;
            let status = orchestrator.status().await?;
            if markdown {
                println!("{}", status.queue_markdown);
            } else {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            Ok(())
        }
        Commands::Metrics { json, history, run } => {
            let ledger = FileLedger::new(config.state_dir.join("ledger")).await?;
            if history {
                println!("{}", ledger.history().await?.to_json()?);
                return Ok(());
            }
            let run_id = match run {
                Some(run_id) => run_id,
                None => match RunStore::new(&config.state_dir).load().await? {
                    Some(state) => state.run_id,
                    None => bail!("no run found in {}", config.state_dir.display()),
                },
            };
            let summary = ledger.summarize(&run_id).await?;
            if json {
                println!("{}", summary.to_json()?);
            } else {
                println!("{}", summary.to_markdown());
            }
            Ok(())
        }
        Commands::Abort => {
            RunStore::new(&config.state_dir).request_abort().await?;
            println!("Abort requested");
            Ok(())
        }
        Commands::Signal {
            task,
            attempt,
            report,
        } => {
            let raw = tokio::fs::read_to_string(&report)
                .await
                .with_context(|| format!("failed to read report {}", report.display()))?;
            let report: WorkerReport =
                serde_json::from_str(&raw).context("invalid worker report")?;
            let channel = FileSignalChannel::open(config.state_dir.join("complete")).await?;
            let record = CompletionRecord::new(TaskId::from(task), attempt, report);
            channel.signal(&record).await?;
            println!("Signaled {}", channel.location(&record.task_id, attempt).display());
            Ok(())
        }
    }
}

async fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if !force && tokio::fs::try_exists(path).await? {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = OrchestratorConfig::default();
    tokio::fs::write(path, config.to_toml_string()?).await?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
async fn load_config(
    path: &Path,
    state_dir: Option<PathBuf>,
) -> anyhow::Result<OrchestratorConfig> {
    let mut config = if tokio::fs::try_exists(path).await? {
        OrchestratorConfig::load(path)
            .await
            .with_context(|| format!("failed to load config {}", path.display()))?
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        OrchestratorConfig::default()
    };
    if let Some(dir) = state_dir {
        config.state_dir = dir;
    }
    config.validate()?;
    Ok(config)
}

fn finish(report: RunReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        bail!(report.summary_line());
    }
    info!("{}", report.summary_line());
    Ok(())
}
