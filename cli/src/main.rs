//! ChainFeed CLI.
//!
//! # Commands
//! ```text
//! chainfeed run   --config <path.yaml> [--chain <id>]
//! chainfeed check --config <path.yaml>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chainfeed_core::AppConfig;
use chainfeed_node::NodeClient;
use chainfeed_processor::{IngestEvent, MemoryCheckpointStore, ProcessorConfig, Supervisor};

mod logging;

#[derive(Parser)]
#[command(
    name = "chainfeed",
    about = "Follow a chain's head over WebSocket and back-fill missed blocks over HTTP",
    long_about = "
ChainFeed CLI: subscribe to newHeads and logs, detect gaps below the live run,
fetch them with eth_getLogs and restart the ingestion task after failures.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides logging.level from the config file
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one configured chain until Ctrl-C
    Run {
        /// Path to the YAML config
        #[arg(short, long)]
        config: PathBuf,
        /// Chain id to ingest (default: first configured chain)
        #[arg(long)]
        chain: Option<u64>,
    },

    /// Validate the config and probe every configured node
    Check {
        /// Path to the YAML config
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, chain } => cmd_run(config, chain).await,
        Commands::Check { config } => cmd_check(config).await,
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn cmd_run(path: PathBuf, chain_id: Option<u64>) -> Result<()> {
    let app = load_config(&path)?;
    logging::init_tracing(&app.logging)?;

    let chain = app.chain(chain_id)?;
    let node = NodeClient::connect(chain, &app.ingest)
        .await
        .with_context(|| format!("connecting to chain {}", chain.chain_id))?;
    let config = ProcessorConfig::from_chain(chain, &app.ingest)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
            }
            cancel.cancel();
        }
    });

    let (tx, mut events) = mpsc::channel(app.ingest.channel_capacity);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    tracing::info!(chain_id = chain.chain_id, url = %chain.stream_url, "starting ingestion");
    let supervisor = Supervisor::new(
        Arc::new(node),
        config,
        Arc::new(MemoryCheckpointStore::new()),
        tx,
    );
    let result = supervisor.run(&cancel).await;
    let snapshot = *supervisor.snapshots().borrow();
    drop(supervisor);
    join_printer(printer).await;

    tracing::info!(
        current = ?snapshot.current_block,
        latest_processed = %snapshot.latest_processed_block,
        "ingestion stopped"
    );
    result.with_context(|| format!("ingestion of chain {} failed", chain.chain_id))
}

/// Wait for the event printer; a panic in it is logged, not swallowed.
async fn join_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "event printer task failed");
            false
        }
    }
}

fn print_event(event: &IngestEvent) {
    match event {
        IngestEvent::Head(height) => tracing::info!(block = %height, "head"),
        IngestEvent::Historic { from, to, logs } => {
            tracing::info!(from = %from, to = %to, logs = logs.len(), "backfill");
            for log in logs {
                tracing::debug!(block = %log.block_number, payload = %log.payload, "historic log");
            }
        }
        IngestEvent::Live(log) => {
            tracing::info!(block = %log.block_number, payload = %log.payload, "log")
        }
    }
}

async fn cmd_check(path: PathBuf) -> Result<()> {
    let app = load_config(&path)?;
    logging::init_tracing(&app.logging)?;
    println!("config OK: {} chain(s)", app.chains.len());

    let mut failed = 0usize;
    for chain in &app.chains {
        match NodeClient::connect(chain, &app.ingest).await {
            Ok(_) => println!("  chain {:>6}  {}  OK", chain.chain_id, chain.url),
            Err(e) => {
                failed += 1;
                println!("  chain {:>6}  {}  FAILED: {e}", chain.chain_id, chain.url);
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} node(s) failed the probe");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn printer_panic_is_reported() {
        let printer = tokio::spawn(async { panic!("broken stdout") });
        assert!(!join_printer(printer).await);
        assert!(join_printer(tokio::spawn(async {})).await);
    }

    #[test]
    fn run_command_parses() {
        let cli = Cli::parse_from(["chainfeed", "run", "--config", "feed.yaml", "--chain", "137"]);
        assert!(matches!(cli.command, Commands::Run { chain: Some(137), .. }));
    }
}
