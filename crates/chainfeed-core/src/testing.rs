//! Scripted test doubles for every node capability.
//!
//! Each `subscribe_*` call consumes the next [`Script`]; once the queue is empty
//! the feed stays open without items. Release counters record how many times
//! the simulated connection was closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::node::{HeadSubscriber, HistoricQuerier, LogSubscriber};
use crate::subscription::{feed, FeedConfig, FeedSender, Subscription, SubscriptionHandle, SubscriptionKind};
use crate::types::{BlockHeight, FilterQuery, LogEvent};

const MOCK_URL: &str = "mock://node";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a scripted session ends once its items are delivered.
#[derive(Debug, Clone)]
pub enum End {
    /// Stay open until cancelled.
    Hold,
    /// Fail mid-stream with this reason.
    Fail(String),
}

/// Behaviour of one subscription session.
#[derive(Debug)]
pub enum Script<T> {
    /// Subscribing fails as if the node could not be dialed.
    RefuseDial(String),
    /// Deliver a fixed list of items, then `then`.
    Items { items: Vec<T>, then: End },
    /// Forward items pushed by the test until the sender is dropped, then `then`.
    Channel {
        rx: mpsc::UnboundedReceiver<T>,
        then: End,
    },
}

impl<T> Script<T> {
    pub fn items(items: impl IntoIterator<Item = T>) -> Self {
        Self::Items {
            items: items.into_iter().collect(),
            then: End::Hold,
        }
    }

    pub fn fail_after(items: impl IntoIterator<Item = T>, reason: impl Into<String>) -> Self {
        Self::Items {
            items: items.into_iter().collect(),
            then: End::Fail(reason.into()),
        }
    }

    /// A session driven by the returned sender.
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::Channel { rx, then: End::Hold })
    }
}

// ─── Scripted feed ────────────────────────────────────────────────────────────

/// A subscription source replaying scripts.
pub struct ScriptedFeed<T> {
    kind: SubscriptionKind,
    config: FeedConfig,
    scripts: Mutex<VecDeque<Script<T>>>,
    handles: Mutex<Vec<SubscriptionHandle>>,
    subscribes: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl<T: Send + 'static> ScriptedFeed<T> {
    pub fn new(kind: SubscriptionKind) -> Self {
        Self {
            kind,
            config: FeedConfig::default(),
            scripts: Mutex::new(VecDeque::new()),
            handles: Mutex::new(Vec::new()),
            subscribes: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_config(mut self, config: FeedConfig) -> Self {
        self.config = config;
        self
    }

    /// Queue the behaviour of the next subscription.
    pub fn push(&self, script: Script<T>) {
        lock(&self.scripts).push_back(script);
    }

    /// Number of subscribe attempts, including refused ones.
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Number of simulated connection closes.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Handles of every session that reached `Streaming`.
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        lock(&self.handles).clone()
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<Subscription<T>, FeedError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or(Script::Items { items: Vec::new(), then: End::Hold });

        let (tx, rx) = feed(self.kind, cancel, self.config);
        tx.handle().mark_subscribing();
        if let Script::RefuseDial(reason) = script {
            tx.handle().mark_failed();
            return Err(FeedError::Dial {
                url: MOCK_URL.into(),
                reason,
            });
        }
        tx.handle().mark_streaming();
        lock(&self.handles).push(tx.handle().clone());

        let releases = Arc::clone(&self.releases);
        tokio::spawn(async move {
            let outcome = drive(&tx, script).await;
            tx.finish(outcome, async move {
                releases.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });
        Ok(rx)
    }
}

/// Play a script; `None` means the session was cancelled.
async fn drive<T>(tx: &FeedSender<T>, script: Script<T>) -> Option<FeedError> {
    let then = match script {
        Script::RefuseDial(_) => return None,
        Script::Items { items, then } => {
            for item in items {
                if let Err(e) = tx.deliver(item).await {
                    return Some(e);
                }
            }
            then
        }
        Script::Channel { mut rx, then } => {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = tx.cancelled() => return None,
                    item = rx.recv() => item,
                };
                match item {
                    Some(item) => {
                        if let Err(e) = tx.deliver(item).await {
                            return Some(e);
                        }
                    }
                    None => break,
                }
            }
            then
        }
    };
    match then {
        End::Hold => {
            tx.cancelled().await;
            None
        }
        End::Fail(reason) => Some(FeedError::subscription(tx.kind().as_str(), reason)),
    }
}

// ─── Capability doubles ───────────────────────────────────────────────────────

/// Test double for [`HeadSubscriber`].
pub struct MockHeadSubscriber {
    pub feed: ScriptedFeed<BlockHeight>,
}

impl Default for MockHeadSubscriber {
    fn default() -> Self {
        Self {
            feed: ScriptedFeed::new(SubscriptionKind::NewHeads),
        }
    }
}

impl MockHeadSubscriber {
    /// Queue a session delivering `heights` and then holding open.
    pub fn push_heights(&self, heights: impl IntoIterator<Item = u64>) {
        self.feed
            .push(Script::items(heights.into_iter().map(BlockHeight::new)));
    }
}

#[async_trait]
impl HeadSubscriber for MockHeadSubscriber {
    async fn subscribe_heads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<BlockHeight>, FeedError> {
        self.feed.open(cancel).await
    }
}

/// Test double for [`LogSubscriber`]; records every filter it was asked for.
pub struct MockLogSubscriber {
    pub feed: ScriptedFeed<LogEvent>,
    queries: Mutex<Vec<FilterQuery>>,
}

impl Default for MockLogSubscriber {
    fn default() -> Self {
        Self {
            feed: ScriptedFeed::new(SubscriptionKind::Logs),
            queries: Mutex::new(Vec::new()),
        }
    }
}

impl MockLogSubscriber {
    pub fn queries(&self) -> Vec<FilterQuery> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl LogSubscriber for MockLogSubscriber {
    async fn subscribe_logs(
        &self,
        query: &FilterQuery,
        cancel: &CancellationToken,
    ) -> Result<Subscription<LogEvent>, FeedError> {
        lock(&self.queries).push(query.clone());
        self.feed.open(cancel).await
    }
}

/// Canned answer of the historic querier.
#[derive(Debug, Clone)]
pub enum Reply {
    /// One synthetic log per block of the requested range.
    PerBlock,
    Logs(Vec<LogEvent>),
    Fail(String),
    /// Answer `PerBlock` after a delay.
    Delayed(Duration),
    /// Never answer.
    Hang,
}

/// Test double for [`HistoricQuerier`].
pub struct MockHistoricQuerier {
    replies: Mutex<VecDeque<Reply>>,
    queries: Mutex<Vec<FilterQuery>>,
    calls: watch::Sender<usize>,
}

impl Default for MockHistoricQuerier {
    fn default() -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            replies: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
            calls,
        }
    }
}

impl MockHistoricQuerier {
    /// Queue the answer to the next query; unqueued queries get [`Reply::PerBlock`].
    pub fn push(&self, reply: Reply) {
        lock(&self.replies).push_back(reply);
    }

    /// Every query received so far, in order.
    pub fn queries(&self) -> Vec<FilterQuery> {
        lock(&self.queries).clone()
    }

    /// `(from, to)` of every query received so far.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.queries()
            .iter()
            .map(|q| (q.from_block().get(), q.to_block().get()))
            .collect()
    }

    /// Wait until at least `n` queries were received.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|c| *c >= n).await;
    }

    fn per_block(query: &FilterQuery) -> Vec<LogEvent> {
        (query.from_block().get()..=query.to_block().get())
            .map(|n| LogEvent::new(BlockHeight::new(n), json!({ "blockNumber": BlockHeight::new(n).to_hex() })))
            .collect()
    }
}

#[async_trait]
impl HistoricQuerier for MockHistoricQuerier {
    async fn query_historic_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, FeedError> {
        lock(&self.queries).push(query.clone());
        let reply = lock(&self.replies).pop_front().unwrap_or(Reply::PerBlock);
        self.calls.send_modify(|c| *c += 1);
        match reply {
            Reply::PerBlock => Ok(Self::per_block(query)),
            Reply::Logs(logs) => Ok(logs),
            Reply::Fail(reason) => Err(FeedError::HistoricQuery {
                from: query.from_block(),
                to: query.to_block(),
                reason,
            }),
            Reply::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Self::per_block(query))
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// All three doubles behind one [`crate::node::NodeConnection`].
#[derive(Default)]
pub struct MockNode {
    pub heads: MockHeadSubscriber,
    pub logs: MockLogSubscriber,
    pub history: MockHistoricQuerier,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeadSubscriber for MockNode {
    async fn subscribe_heads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<BlockHeight>, FeedError> {
        self.heads.subscribe_heads(cancel).await
    }
}

#[async_trait]
impl LogSubscriber for MockNode {
    async fn subscribe_logs(
        &self,
        query: &FilterQuery,
        cancel: &CancellationToken,
    ) -> Result<Subscription<LogEvent>, FeedError> {
        self.logs.subscribe_logs(query, cancel).await
    }
}

#[async_trait]
impl HistoricQuerier for MockNode {
    async fn query_historic_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, FeedError> {
        self.history.query_historic_logs(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_closes_connection_once() {
        let heads = MockHeadSubscriber::default();
        heads.push_heights([1, 2]);
        let cancel = CancellationToken::new();
        let mut sub = heads.subscribe_heads(&cancel).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), BlockHeight::new(1));

        cancel.cancel();
        cancel.cancel();
        sub.handle().closed().await;
        assert_eq!(heads.feed.release_count(), 1);
        assert!(sub.next().await.unwrap_err().is_cancelled());

        sub.close().await;
        assert_eq!(heads.feed.release_count(), 1);
    }

    #[tokio::test]
    async fn refused_dial_is_reported() {
        let heads = MockHeadSubscriber::default();
        heads.feed.push(Script::RefuseDial("connection refused".into()));
        let err = heads
            .subscribe_heads(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Dial { .. }));
        assert_eq!(heads.feed.release_count(), 0);
    }

    #[tokio::test]
    async fn historic_failure_then_default() {
        let history = MockHistoricQuerier::default();
        history.push(Reply::Fail("timeout".into()));
        let q = FilterQuery::new(BlockHeight::new(51), BlockHeight::new(59)).unwrap();
        assert!(history.query_historic_logs(&q).await.is_err());
        let logs = history.query_historic_logs(&q).await.unwrap();
        assert_eq!(logs.len(), 9);
        assert_eq!(history.ranges(), vec![(51, 59), (51, 59)]);
    }
}
