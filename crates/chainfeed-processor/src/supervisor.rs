//! Restarts the ingestion task after fatal errors.
//!
//! Each restart builds a fresh [`BlockProcessor`] from the shared checkpoint
//! store, so a new run continues from the last processed block. Consecutive
//! failures back off exponentially; a run that saw at least one head resets
//! the count.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use chainfeed_core::{FeedError, NodeConnection, RetryPolicy};

use crate::checkpoint::CheckpointStore;
use crate::health::HealthMonitor;
use crate::processor::{BlockProcessor, IngestEvent, ProcessorConfig};
use crate::state::{ProcessorSnapshot, ProcessorState};

pub struct Supervisor<N: NodeConnection> {
    node: Arc<N>,
    config: ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    events: mpsc::Sender<IngestEvent>,
    health: HealthMonitor,
    snapshots: Arc<watch::Sender<ProcessorSnapshot>>,
}

impl<N: NodeConnection> Supervisor<N> {
    pub fn new(
        node: Arc<N>,
        config: ProcessorConfig,
        store: Arc<dyn CheckpointStore>,
        events: mpsc::Sender<IngestEvent>,
    ) -> Self {
        let (snapshots, _) = watch::channel(ProcessorState::new(config.start_block).snapshot());
        Self {
            node,
            health: HealthMonitor::new(config.freshness_window),
            store,
            events,
            snapshots: Arc::new(snapshots),
            config,
        }
    }

    /// Health of whichever run is current.
    pub fn health(&self) -> HealthMonitor {
        self.health.clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<ProcessorSnapshot> {
        self.snapshots.subscribe()
    }

    /// Run until cancelled (`Ok`) or until the restart limit is exhausted
    /// (the last error).
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), FeedError> {
        let mut backoff = RetryPolicy::new(self.config.restart.clone()).backoff();
        let mut run = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            run += 1;
            let mut processor = BlockProcessor::new(
                Arc::clone(&self.node),
                self.config.clone(),
                self.events.clone(),
            )
            .with_checkpoints(Arc::clone(&self.store))
            .with_health(self.health.clone())
            .with_snapshots(Arc::clone(&self.snapshots))
            .resume()
            .await?;

            let err = match processor.track_latest_block(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if processor.heads_observed() > 0 {
                backoff.reset();
            }
            tracing::warn!(
                chain_id = self.config.chain_id,
                run,
                failures = backoff.attempts() + 1,
                error = %err,
                "ingestion task failed"
            );
            if !backoff.wait(cancel).await {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                tracing::error!(
                    chain_id = self.config.chain_id,
                    restarts = backoff.attempts().saturating_sub(1),
                    "restart limit reached, giving up"
                );
                return Err(err);
            }
            tracing::info!(chain_id = self.config.chain_id, run = run + 1, "restarting ingestion task");
        }
    }
}
