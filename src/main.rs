//! # Scanloop — scheduled automation-task runner
//!
//! Periodically executes automation tasks against a batch-processing
//! backend and notifies external systems through signed webhooks.
//!
//! Usage:
//!   scanloop                      # Serve the gateway + background heartbeat
//!   scanloop serve --port 8710    # Same, explicit
//!   scanloop dispatch             # One-shot: enqueue due tasks, then exit
//!   scanloop work                 # One-shot: drain the queue, then exit

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scanloop_core::ScanloopConfig;
use scanloop_gateway::serve;
use scanloop_scheduler::{
    AutomationEngine, BatchRunner, HttpRunner, LocalRunner, WebhookNotifier, run_heartbeat,
};
use scanloop_store::StoreDb;

#[derive(Parser)]
#[command(name = "scanloop", version, about = "Scanloop — scheduled automation-task runner")]
struct Cli {
    /// Path to config.toml (default: ~/.scanloop/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Database path override
    #[arg(long)]
    db_path: Option<String>,

    /// Gateway port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway and the background heartbeat (default)
    Serve,
    /// Enqueue due tasks once and exit
    Dispatch,
    /// Drain the queue once and exit
    Work {
        /// Max runs to claim
        #[arg(long, default_value = "25")]
        limit: usize,
    },
    /// Sweep runs orphaned by a crashed executor and exit
    Sweep,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "scanloop=debug,tower_http=debug"
    } else {
        "scanloop=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => ScanloopConfig::load_from(Path::new(&expand_path(path)))?,
        None => ScanloopConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let db_path = expand_path(&config.database.path);
    let store = Arc::new(StoreDb::open(Path::new(&db_path))?);

    let runner: Arc<dyn BatchRunner> = match &config.runner.base_url {
        Some(base_url) => {
            tracing::info!("batch backend: {base_url}");
            Arc::new(HttpRunner::new(base_url, &config.runner))
        }
        None => {
            tracing::info!("no batch backend configured, using the local runner");
            Arc::new(LocalRunner)
        }
    };
    let notifier = WebhookNotifier::new(&config.webhook);
    let engine = Arc::new(AutomationEngine::new(
        store,
        runner,
        notifier,
        config.scheduler.clone(),
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            println!("Scanloop v{}", env!("CARGO_PKG_VERSION"));
            println!("   API:      http://{}:{}/api/v1/health", config.gateway.host, config.gateway.port);
            println!("   Database: {db_path}");

            tokio::spawn(run_heartbeat(engine.clone()));
            serve(engine, &config.gateway.host, config.gateway.port).await?;
        }
        Command::Dispatch => {
            let dispatched = engine.dispatch_due(Utc::now(), config.scheduler.dispatch_limit)?;
            println!("dispatched {dispatched} due task(s)");
        }
        Command::Work { limit } => {
            let processed = engine.process_queue(limit).await;
            println!("processed {processed} queued run(s)");
        }
        Command::Sweep => {
            let swept = engine.requeue_stale_runs(Utc::now());
            println!("swept {swept} stale run(s)");
        }
    }

    Ok(())
}
