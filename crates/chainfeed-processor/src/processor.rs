//! The block processor: follows the chain head and back-fills what was missed.
//!
//! # Live
//! Every head from the `newHeads` subscription goes through
//! [`ProcessorState::observe_head`]. A live log is forwarded once its block
//! is a streamed head; logs ahead of the current head wait for it, and logs
//! of blocks a backfill covers are dropped.
//!
//! # Backfill
//! When a gap opens below the live run, one historic query is spawned on a
//! separate task. Its result comes back over a channel and is applied by the
//! ingestion task, which stays the only writer of the state.
//!
//! ```text
//!  heads ───────┐
//!  logs  ───────┼──▶ track_latest_block ──▶ IngestEvent channel
//!  backfill ◀───┘         ▲
//!     └──── BackfillDone ─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chainfeed_core::{
    BlockHeight, ChainConfig, FeedError, FilterQuery, IngestConfig, LogEvent, NodeConnection,
    RetryConfig, Subscription,
};

use crate::checkpoint::{CheckpointManager, CheckpointStore, MemoryCheckpointStore};
use crate::health::HealthMonitor;
use crate::state::{HeadUpdate, LogPlacement, ProcessorSnapshot, ProcessorState};

/// What the processor hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// An accepted head.
    Head(BlockHeight),
    /// Logs of a successfully back-filled range.
    Historic {
        from: BlockHeight,
        to: BlockHeight,
        logs: Vec<LogEvent>,
    },
    /// A log from the live subscription.
    Live(LogEvent),
}

/// Configuration for one processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub chain_id: u64,
    /// Unique name for this processor (used for checkpoint keys).
    pub id: String,
    /// Last block considered processed when no checkpoint exists.
    pub start_block: BlockHeight,
    /// Address/topic selection. Live logs are only subscribed to when it filters something.
    pub filter: FilterQuery,
    pub freshness_window: Duration,
    /// Save a checkpoint every N advances of the processed height.
    pub checkpoint_interval: u64,
    /// Supervisor backoff; `max_retries` is the restart limit.
    pub restart: RetryConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            id: "chainfeed".into(),
            start_block: BlockHeight::GENESIS,
            filter: FilterQuery::default(),
            freshness_window: Duration::from_secs(60),
            checkpoint_interval: 1,
            restart: RetryConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_chain(chain: &ChainConfig, ingest: &IngestConfig) -> Result<Self, FeedError> {
        Ok(Self {
            chain_id: chain.chain_id,
            id: format!("chainfeed-{}", chain.chain_id),
            start_block: chain.start_height(),
            filter: chain.log_filter()?,
            freshness_window: ingest.freshness_window(),
            checkpoint_interval: ingest.checkpoint_interval,
            restart: ingest.restart(),
        })
    }
}

/// Outcome of a spawned historic query.
struct BackfillDone {
    from: BlockHeight,
    to: BlockHeight,
    result: Result<Vec<LogEvent>, FeedError>,
}

/// Follows one chain through a [`NodeConnection`].
pub struct BlockProcessor<N: NodeConnection> {
    node: Arc<N>,
    config: ProcessorConfig,
    state: ProcessorState,
    checkpoint: CheckpointManager,
    health: HealthMonitor,
    events: mpsc::Sender<IngestEvent>,
    snapshots: Arc<watch::Sender<ProcessorSnapshot>>,
    heads_observed: u64,
    /// Live logs whose head has not arrived yet.
    pending_logs: Vec<LogEvent>,
    consumer_gone: bool,
}

impl<N: NodeConnection> BlockProcessor<N> {
    /// A processor starting at `config.start_block` with an in-memory checkpoint store.
    pub fn new(node: Arc<N>, config: ProcessorConfig, events: mpsc::Sender<IngestEvent>) -> Self {
        let state = ProcessorState::new(config.start_block);
        let checkpoint = CheckpointManager::new(
            Arc::new(MemoryCheckpointStore::new()),
            config.chain_id,
            &config.id,
            config.checkpoint_interval,
        );
        let (snapshots, _) = watch::channel(state.snapshot());
        Self {
            node,
            health: HealthMonitor::new(config.freshness_window),
            checkpoint,
            state,
            events,
            snapshots: Arc::new(snapshots),
            heads_observed: 0,
            pending_logs: Vec::new(),
            consumer_gone: false,
            config,
        }
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = CheckpointManager::new(
            store,
            self.config.chain_id,
            &self.config.id,
            self.config.checkpoint_interval,
        );
        self
    }

    pub fn with_health(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<watch::Sender<ProcessorSnapshot>>) -> Self {
        self.snapshots = snapshots;
        self.publish();
        self
    }

    /// Restart from the saved checkpoint when it is ahead of `start_block`.
    pub async fn resume(mut self) -> Result<Self, FeedError> {
        let mut start = self.config.start_block;
        if let Some(cp) = self.checkpoint.load().await? {
            tracing::info!(
                chain_id = self.config.chain_id,
                block = %cp.block_number,
                "resuming from checkpoint"
            );
            start = start.max(cp.block_number);
        }
        self.state = ProcessorState::new(start);
        self.publish();
        Ok(self)
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn snapshots(&self) -> watch::Receiver<ProcessorSnapshot> {
        self.snapshots.subscribe()
    }

    /// Heads accepted since this processor was built.
    pub fn heads_observed(&self) -> u64 {
        self.heads_observed
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.state.snapshot());
    }

    async fn emit(&mut self, event: IngestEvent, cancel: &CancellationToken) -> Result<(), FeedError> {
        if self.consumer_gone {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FeedError::Cancelled),
            sent = self.events.send(event) => {
                if sent.is_err() {
                    tracing::warn!(chain_id = self.config.chain_id, "event consumer dropped, events are discarded from now on");
                    self.consumer_gone = true;
                }
                Ok(())
            }
        }
    }

    async fn processed_advanced(&mut self, before: BlockHeight) {
        let latest = self.state.latest_processed_block();
        if latest > before {
            if let Err(e) = self.checkpoint.maybe_save(latest).await {
                tracing::warn!(error = %e, block = %latest, "checkpoint save failed");
            }
        }
    }

    /// Feed one head into the state.
    ///
    /// An out-of-order head is logged, counted and returned; the state is unchanged.
    pub async fn observe_head(
        &mut self,
        height: BlockHeight,
        cancel: &CancellationToken,
    ) -> Result<HeadUpdate, FeedError> {
        let before = self.state.latest_processed_block();
        let update = match self.state.observe_head(height) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(chain_id = self.config.chain_id, error = %e, "ignoring out-of-order head");
                self.health.record_out_of_order();
                return Err(e);
            }
        };
        self.health.record_head(height);
        match update {
            HeadUpdate::Duplicate => {
                tracing::debug!(block = %height, "duplicate head");
                return Ok(update);
            }
            HeadUpdate::Behind => {
                tracing::debug!(
                    block = %height,
                    latest_processed = %self.state.latest_processed_block(),
                    "head at or below the processed height, waiting for the node to catch up"
                );
                self.health.record_head_behind();
                return Ok(update);
            }
            HeadUpdate::Accepted => {}
        }
        self.heads_observed += 1;
        tracing::debug!(
            block = %height,
            latest_processed = %self.state.latest_processed_block(),
            "new head"
        );
        self.publish();
        self.processed_advanced(before).await;
        self.emit(IngestEvent::Head(height), cancel).await?;
        self.flush_pending_logs(cancel).await?;
        Ok(update)
    }

    /// Route one log from the live subscription.
    async fn on_live_log(&mut self, log: LogEvent, cancel: &CancellationToken) -> Result<(), FeedError> {
        match self.state.place_log(log.block_number) {
            LogPlacement::Deliver => self.emit(IngestEvent::Live(log), cancel).await,
            LogPlacement::Hold => {
                self.pending_logs.push(log);
                Ok(())
            }
            LogPlacement::Covered => {
                tracing::debug!(block = %log.block_number, "live log covered by backfill, dropped");
                Ok(())
            }
        }
    }

    /// Re-route held logs after the head moved.
    async fn flush_pending_logs(&mut self, cancel: &CancellationToken) -> Result<(), FeedError> {
        if self.pending_logs.is_empty() {
            return Ok(());
        }
        for log in std::mem::take(&mut self.pending_logs) {
            self.on_live_log(log, cancel).await?;
        }
        Ok(())
    }

    /// Apply a finished historic query. Returns `true` if the state advanced.
    async fn complete_backfill(&mut self, done: BackfillDone, cancel: &CancellationToken) -> Result<bool, FeedError> {
        let BackfillDone { from, to, result } = done;
        let logs = match result {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(from = %from, to = %to, error = %e, "historic backfill failed, retrying on next head");
                self.health.record_failed_backfill();
                return Err(e);
            }
        };
        let before = self.state.latest_processed_block();
        if !self.state.apply_backfill(from, to) {
            tracing::warn!(
                from = %from,
                to = %to,
                latest_processed = %before,
                "discarding stale backfill result"
            );
            return Ok(false);
        }
        tracing::info!(from = %from, to = %to, logs = logs.len(), "backfill complete");
        self.publish();
        self.processed_advanced(before).await;
        self.emit(IngestEvent::Historic { from, to, logs }, cancel).await?;
        Ok(true)
    }

    /// Sequential backfill: plan, query, apply.
    ///
    /// Returns the covered range, or `None` when there is no gap. On failure the
    /// state is unchanged and the gap is still reported by the next call.
    pub async fn run_backfill(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<(BlockHeight, BlockHeight)>, FeedError> {
        let Some((from, to)) = self.state.backfill_range() else {
            return Ok(None);
        };
        let query = self.config.filter.with_range(from, to)?;
        tracing::info!(from = %from, to = %to, "starting historic backfill");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FeedError::Cancelled),
            result = self.node.query_historic_logs(&query) => result,
        };
        let applied = self
            .complete_backfill(BackfillDone { from, to, result }, cancel)
            .await?;
        Ok(applied.then_some((from, to)))
    }

    /// Start a historic query for the current gap unless one is running.
    fn spawn_backfill(&self, inflight: &mut Option<JoinHandle<()>>, done_tx: &mpsc::Sender<BackfillDone>) -> bool {
        if inflight.is_some() {
            return false;
        }
        let Some((from, to)) = self.state.backfill_range() else {
            return false;
        };
        let query = match self.config.filter.with_range(from, to) {
            Ok(q) => q,
            Err(e) => {
                tracing::error!(error = %e, "cannot build backfill query");
                return false;
            }
        };
        tracing::info!(from = %from, to = %to, blocks = query.block_count(), "starting historic backfill");
        let node = Arc::clone(&self.node);
        let done_tx = done_tx.clone();
        *inflight = Some(tokio::spawn(async move {
            let result = node.query_historic_logs(&query).await;
            let _ = done_tx.send(BackfillDone { from, to, result }).await;
        }));
        true
    }

    /// The ingestion task.
    ///
    /// Runs until `cancel` fires (`Ok`) or a subscription fails (`Err`). Both
    /// subscriptions are closed and any in-flight backfill is aborted on every
    /// exit path; the processed height is checkpointed.
    pub async fn track_latest_block(&mut self, cancel: &CancellationToken) -> Result<(), FeedError> {
        let run = cancel.child_token();
        let chain_id = self.config.chain_id;

        self.pending_logs.clear();

        // Logs stream before heads, so every head seen here has its logs pushed live.
        let mut logs = None;
        if !self.config.filter.is_unfiltered() {
            match self.node.subscribe_logs(&self.config.filter, &run).await {
                Ok(sub) => logs = Some(sub),
                Err(e) => return self.stopped(e),
            }
        }
        let mut heads = match self.node.subscribe_heads(&run).await {
            Ok(sub) => sub,
            Err(e) => {
                if let Some(logs) = &logs {
                    logs.close().await;
                }
                return self.stopped(e);
            }
        };
        tracing::info!(
            chain_id,
            latest_processed = %self.state.latest_processed_block(),
            live_logs = logs.is_some(),
            "tracking latest block"
        );

        let mut inflight = None;
        let outcome = self.ingest(&run, &mut heads, &mut logs, &mut inflight).await;

        if let Some(task) = inflight.take() {
            task.abort();
        }
        run.cancel();
        heads.close().await;
        if let Some(logs) = &logs {
            logs.close().await;
        }
        let latest = self.state.latest_processed_block();
        if let Err(e) = self.checkpoint.force_save(latest).await {
            tracing::warn!(error = %e, block = %latest, "final checkpoint save failed");
        }

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => self.stopped(e),
        }
    }

    /// Map the end of a run to its result, logging and recording failures.
    fn stopped(&self, e: FeedError) -> Result<(), FeedError> {
        if e.is_cancelled() {
            tracing::info!(chain_id = self.config.chain_id, "ingestion cancelled");
            return Ok(());
        }
        tracing::error!(chain_id = self.config.chain_id, error = %e, "ingestion stopped");
        self.health.record_error(&e);
        Err(e)
    }

    async fn ingest(
        &mut self,
        run: &CancellationToken,
        heads: &mut Subscription<BlockHeight>,
        logs: &mut Option<Subscription<LogEvent>>,
        inflight: &mut Option<JoinHandle<()>>,
    ) -> Result<(), FeedError> {
        let (done_tx, mut done_rx) = mpsc::channel::<BackfillDone>(1);
        // Heads observed when the running backfill was started.
        let mut spawned_at = self.heads_observed;
        if self.spawn_backfill(inflight, &done_tx) {
            spawned_at = self.heads_observed;
        }

        loop {
            tokio::select! {
                biased;
                _ = run.cancelled() => return Err(FeedError::Cancelled),
                Some(done) = done_rx.recv() => {
                    *inflight = None;
                    // A failed backfill is retried once a newer head arrived.
                    let retry = match self.complete_backfill(done, run).await {
                        Ok(_) => true,
                        Err(_) => self.heads_observed > spawned_at,
                    };
                    if retry && self.spawn_backfill(inflight, &done_tx) {
                        spawned_at = self.heads_observed;
                    }
                }
                head = heads.next() => {
                    match self.observe_head(head?, run).await {
                        Err(FeedError::OutOfOrderHeight { .. }) => {}
                        other => {
                            other?;
                        }
                    }
                    if self.spawn_backfill(inflight, &done_tx) {
                        spawned_at = self.heads_observed;
                    }
                }
                log = next_log(logs) => {
                    self.on_live_log(log?, run).await?;
                }
            }
        }
    }
}

async fn next_log(logs: &mut Option<Subscription<LogEvent>>) -> Result<LogEvent, FeedError> {
    match logs {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use chainfeed_core::testing::{MockNode, Reply};

    use super::*;

    fn processor(node: Arc<MockNode>, start: u64) -> (BlockProcessor<MockNode>, mpsc::Receiver<IngestEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let config = ProcessorConfig {
            start_block: BlockHeight::new(start),
            ..ProcessorConfig::default()
        };
        (BlockProcessor::new(node, config, tx), rx)
    }

    #[tokio::test]
    async fn sequential_backfill_closes_the_gap() {
        let node = Arc::new(MockNode::new());
        let (mut p, mut events) = processor(Arc::clone(&node), 100);
        let cancel = CancellationToken::new();

        p.observe_head(BlockHeight::new(105), &cancel).await.unwrap();
        assert!(p.state().needs_historic_backfill());

        let covered = p.run_backfill(&cancel).await.unwrap();
        assert_eq!(covered, Some((BlockHeight::new(101), BlockHeight::new(104))));
        assert_eq!(p.state().latest_processed_block(), BlockHeight::new(104));
        assert!(!p.state().needs_historic_backfill());
        assert_eq!(p.run_backfill(&cancel).await.unwrap(), None);
        assert_eq!(node.history.ranges(), vec![(101, 104)]);

        assert_eq!(events.recv().await, Some(IngestEvent::Head(BlockHeight::new(105))));
        let Some(IngestEvent::Historic { logs, .. }) = events.recv().await else {
            panic!("expected historic logs");
        };
        assert_eq!(logs.len(), 4);
    }

    #[tokio::test]
    async fn failed_backfill_leaves_state_unchanged() {
        let node = Arc::new(MockNode::new());
        node.history.push(Reply::Fail("timeout".into()));
        let (mut p, _events) = processor(Arc::clone(&node), 100);
        let cancel = CancellationToken::new();

        p.observe_head(BlockHeight::new(105), &cancel).await.unwrap();
        let err = p.run_backfill(&cancel).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(p.state().latest_processed_block(), BlockHeight::new(100));
        assert!(p.state().needs_historic_backfill());
        assert_eq!(p.health().report().failed_backfills, 1);

        assert!(p.run_backfill(&cancel).await.unwrap().is_some());
        assert_eq!(node.history.ranges(), vec![(101, 104), (101, 104)]);
    }

    #[tokio::test]
    async fn out_of_order_head_is_counted() {
        let node = Arc::new(MockNode::new());
        let (mut p, _events) = processor(node, 0);
        let cancel = CancellationToken::new();

        p.observe_head(BlockHeight::new(12), &cancel).await.unwrap();
        let err = p.observe_head(BlockHeight::new(11), &cancel).await.unwrap_err();
        assert!(matches!(err, FeedError::OutOfOrderHeight { .. }));
        assert_eq!(p.state().current_block(), Some(BlockHeight::new(12)));
        assert_eq!(p.health().report().out_of_order_heads, 1);
    }

    #[tokio::test]
    async fn snapshots_follow_the_state() {
        let node = Arc::new(MockNode::new());
        let (mut p, _events) = processor(node, 104);
        let snapshots = p.snapshots();
        let cancel = CancellationToken::new();

        p.observe_head(BlockHeight::new(105), &cancel).await.unwrap();
        let snap = *snapshots.borrow();
        assert_eq!(snap.current_block, Some(BlockHeight::new(105)));
        assert_eq!(snap.first_streamed_block, Some(BlockHeight::new(105)));
        assert_eq!(snap.latest_processed_block, BlockHeight::new(104));
    }

    #[tokio::test]
    async fn resume_prefers_a_higher_checkpoint() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let config = ProcessorConfig {
            start_block: BlockHeight::new(50),
            ..ProcessorConfig::default()
        };
        CheckpointManager::new(Arc::clone(&store), config.chain_id, &config.id, 1)
            .force_save(BlockHeight::new(80))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let p = BlockProcessor::new(Arc::new(MockNode::new()), config, tx)
            .with_checkpoints(store)
            .resume()
            .await
            .unwrap();
        assert_eq!(p.state().latest_processed_block(), BlockHeight::new(80));
    }
}
