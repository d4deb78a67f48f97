//! Baton CLI - multi-agent orchestration core
//!
//! Usage:
//!   baton init [path]           Write default .baton/config.toml
//!   baton config [path]         Print the effective configuration
//!   baton simulate              Run an in-process pipeline, print fidelity

use anyhow::{Context, Result};
use baton_consensus::{ConsensusAlgorithm, VoteOption};
use baton_core::{BatonConfig, ManualClock, Priority, SequentialIds, Task, Worker};
use baton_orchestrator::{Orchestrator, ScriptedExecutor};
use baton_recovery::StaticFallback;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "baton")]
#[command(author, version, about = "Multi-agent orchestration core")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Repository path (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Run a deterministic in-process pipeline and print its fidelity report
    Simulate {
        /// Configuration root (defaults to current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Number of tasks to submit
        #[arg(short = 'n', long, default_value = "24")]
        tasks: usize,

        /// Make every Nth task fail on its first attempt (0 disables)
        #[arg(long, default_value = "5")]
        flaky_every: usize,

        /// Make every Nth task fail permanently (0 disables)
        #[arg(long, default_value = "0")]
        broken_every: usize,

        /// Consensus algorithm for the simulated vote
        #[arg(long, default_value = "weighted-majority")]
        algorithm: ConsensusAlgorithm,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `simulate` output stays parseable
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Config { path } => cmd_config(&path),
        Commands::Simulate {
            path,
            tasks,
            flaky_every,
            broken_every,
            algorithm,
        } => cmd_simulate(&path, tasks, flaky_every, broken_every, algorithm).await,
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    let config_path = path.join(".baton/config.toml");
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    BatonConfig::write_default(path)
        .with_context(|| format!("Failed to write config under {:?}", path))?;
    info!("Initialized Baton in {:?}", path);
    println!("Created {}", config_path.display());
    Ok(())
}

fn cmd_config(path: &Path) -> Result<()> {
    let config = BatonConfig::load_or_default(path).context("Failed to load configuration")?;
    print!("{}", config.to_toml()?);
    Ok(())
}

const SIMULATED_WORKERS: [(&str, &str, u32, &[&str]); 4] = [
    ("w-1", "Ada", 3, &["rust", "backend", "database"]),
    ("w-2", "Grace", 2, &["compiler", "rust"]),
    ("w-3", "Margaret", 2, &["docs", "review"]),
    ("w-4", "Linus", 1, &["kernel"]),
];

const SIMULATED_TASKS: [(&str, &str); 6] = [
    ("backend", "add rust backend endpoint"),
    ("database", "tune database indexes"),
    ("docs", "review docs for release"),
    ("compiler", "fix compiler warning"),
    ("kernel", "kernel driver patch"),
    ("general", "triage incoming issues"),
];

async fn cmd_simulate(
    path: &Path,
    task_count: usize,
    flaky_every: usize,
    broken_every: usize,
    algorithm: ConsensusAlgorithm,
) -> Result<()> {
    let config = BatonConfig::load_or_default(path).context("Failed to load configuration")?;
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = Orchestrator::with_runtime(
        config,
        executor.clone(),
        Arc::new(ManualClock::default()),
        Arc::new(SequentialIds::new()),
    );
    let _pipeline = orchestrator.attach();

    for (id, name, capacity, expertise) in SIMULATED_WORKERS {
        orchestrator
            .register_worker(Worker::new(id, name, capacity).with_expertise(expertise.iter().copied()))
            .await?;
    }
    orchestrator.fallbacks().register(Arc::new(StaticFallback::new(
        "cached-docs",
        &["docs"],
        json!({"output": "served from docs cache"}),
    )));

    info!(tasks = task_count, "Starting simulation");
    for i in 1..=task_count {
        let (category, description) = SIMULATED_TASKS[(i - 1) % SIMULATED_TASKS.len()];
        let task = Task::new(format!("task-{}", i), description)
            .with_category(category)
            .with_context(json!({"sequence": i}));

        if broken_every > 0 && i % broken_every == 0 {
            executor.fail_next(&task.id, u32::MAX);
        } else if flaky_every > 0 && i % flaky_every == 0 {
            executor.fail_next(&task.id, 1);
        }
        orchestrator.submit_task(&task);
    }
    orchestrator.wait_idle().await;

    // One handoff round trip
    let handoff_task = Task::new("task-handoff", "continue database migration");
    let handoff = orchestrator
        .hand_off(
            "w-1",
            "w-2",
            &handoff_task,
            json!({"migration": "0042", "step": 3}),
            Priority::High,
        )
        .await?;
    orchestrator.accept_handoff(&handoff.id, "w-2").await?;

    // One vote among every worker
    let options = vec![
        VoteOption::new("ship", "Ship the release"),
        VoteOption::new("hold", "Hold for another review"),
    ];
    let ballots: Vec<(String, String)> = SIMULATED_WORKERS
        .iter()
        .enumerate()
        .map(|(i, (id, ..))| {
            let choice = if i == SIMULATED_WORKERS.len() - 1 { "hold" } else { "ship" };
            (id.to_string(), choice.to_string())
        })
        .collect();
    let decision = orchestrator
        .decide("release readiness", options, &ballots, algorithm, None)
        .await?;
    info!(
        winner = ?decision.winning_option,
        confidence = decision.confidence,
        "Simulated vote resolved"
    );

    let report = orchestrator.fidelity_report().await;
    let stats = orchestrator.events().stats();
    info!(
        published = stats.published,
        delivered = stats.delivered,
        handler_failures = stats.handler_failures,
        executions = executor.calls(),
        "Simulation complete"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
