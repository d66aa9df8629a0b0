//! Streaming feed plumbing shared by every subscription implementation.
//!
//! A feed is split in two halves:
//!
//! ```text
//! producer task ── FeedSender<T> ──[bounded items]──▶ Subscription<T> ── consumer
//!                               └──[errors (1)]────▶
//! ```
//!
//! Both halves share a [`SubscriptionHandle`], which owns the lifecycle state
//! machine and the cancellation token. The producer releases the transport
//! through [`SubscriptionHandle::close_with`], which runs its release future at
//! most once however many times cancellation is signalled.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::FeedError;

// ─── Kind / state ─────────────────────────────────────────────────────────────

/// What a subscription streams; the string form is the `eth_subscribe` kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    NewHeads,
    Logs,
}

impl SubscriptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewHeads => "newHeads",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single subscription.
///
/// ```text
/// Disconnected → Subscribing → Streaming → Closing → Closed
///                     └──(dial/subscribe failure)──▶ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Streaming,
    Closing,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Subscribing => write!(f, "subscribing"),
            Self::Streaming => write!(f, "streaming"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

struct HandleInner {
    kind: SubscriptionKind,
    state: watch::Sender<SubscriptionState>,
    cancel: CancellationToken,
}

/// Shared lifecycle state of one subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    /// A new handle in `Disconnected`. Its token is a child of `parent`, so
    /// cancelling the parent cancels this subscription but not vice versa.
    pub fn new(kind: SubscriptionKind, parent: &CancellationToken) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        Self {
            inner: Arc::new(HandleInner {
                kind,
                state,
                cancel: parent.child_token(),
            }),
        }
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.inner.kind
    }

    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.borrow()
    }

    /// Token observed by the producer; cancelled on a stop request.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Ask the producer to stop. Idempotent.
    pub fn request_close(&self) {
        self.inner.cancel.cancel();
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.inner.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// `Disconnected → Subscribing`.
    pub fn mark_subscribing(&self) -> bool {
        self.transition(SubscriptionState::Disconnected, SubscriptionState::Subscribing)
    }

    /// `Subscribing → Streaming`.
    pub fn mark_streaming(&self) -> bool {
        self.transition(SubscriptionState::Subscribing, SubscriptionState::Streaming)
    }

    /// `Subscribing → Disconnected`, after a dial or subscribe failure.
    pub fn mark_failed(&self) -> bool {
        self.transition(SubscriptionState::Subscribing, SubscriptionState::Disconnected)
    }

    /// Enter `Closing`, run `release`, then enter `Closed`.
    ///
    /// Only the first caller runs `release` and gets `true`; any later call
    /// (repeated cancellation, error after cancel, ...) is a no-op returning `false`.
    pub async fn close_with<F>(&self, release: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let won = self.inner.state.send_if_modified(|s| match s {
            SubscriptionState::Closing | SubscriptionState::Closed => false,
            _ => {
                *s = SubscriptionState::Closing;
                true
            }
        });
        if !won {
            return false;
        }
        release.await;
        self.inner.state.send_replace(SubscriptionState::Closed);
        tracing::debug!(kind = %self.inner.kind, "subscription closed");
        true
    }

    /// Resolves once the subscription reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so `wait_for` can only fail if it is dropped.
        let _ = rx.wait_for(|s| *s == SubscriptionState::Closed).await;
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

// ─── Feed configuration ──────────────────────────────────────────────────────

/// What the producer does when the consumer's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room; after `timeout_ms` the subscription fails as stalled.
    Block { timeout_ms: u64 },
    /// Drop the new item and log a warning.
    Drop,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Block { timeout_ms: 30_000 }
    }
}

/// Buffering parameters for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: 1_024,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Create both halves of a feed bound to `parent`'s cancellation.
pub fn feed<T>(
    kind: SubscriptionKind,
    parent: &CancellationToken,
    config: FeedConfig,
) -> (FeedSender<T>, Subscription<T>) {
    let handle = SubscriptionHandle::new(kind, parent);
    let (items_tx, items_rx) = mpsc::channel(config.capacity.max(1));
    let (errors_tx, errors_rx) = mpsc::channel(1);
    (
        FeedSender {
            handle: handle.clone(),
            items: items_tx,
            errors: errors_tx,
            overflow: config.overflow,
        },
        Subscription {
            handle,
            items: items_rx,
            errors: errors_rx,
        },
    )
}

// ─── Producer half ───────────────────────────────────────────────────────────

/// Producer end of a feed, owned by the task that talks to the transport.
pub struct FeedSender<T> {
    handle: SubscriptionHandle,
    items: mpsc::Sender<T>,
    errors: mpsc::Sender<FeedError>,
    overflow: OverflowPolicy,
}

impl<T> FeedSender<T> {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.handle.kind()
    }

    /// Resolves when the consumer or a parent token asks the feed to stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.handle.cancel_token().cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.cancel_token().is_cancelled()
    }

    /// Hand one item to the consumer, in order, applying the overflow policy.
    ///
    /// An `Err` means the feed cannot continue: it was cancelled, the consumer
    /// went away, or a blocking send timed out.
    pub async fn deliver(&self, item: T) -> Result<(), FeedError> {
        match self.overflow {
            OverflowPolicy::Drop => match self.items.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(kind = %self.kind(), "consumer buffer full, dropping item");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(FeedError::subscription(self.kind().as_str(), "consumer dropped"))
                }
            },
            OverflowPolicy::Block { timeout_ms } => {
                let timeout = Duration::from_millis(timeout_ms);
                tokio::select! {
                    biased;
                    _ = self.cancelled() => Err(FeedError::Cancelled),
                    sent = tokio::time::timeout(timeout, self.items.send(item)) => match sent {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) => Err(FeedError::subscription(self.kind().as_str(), "consumer dropped")),
                        Err(_) => Err(FeedError::subscription(
                            self.kind().as_str(),
                            format!("consumer stalled for {timeout_ms}ms"),
                        )),
                    },
                }
            }
        }
    }

    /// Surface a terminal error to the consumer. Only the first error is kept.
    pub fn fail(&self, error: FeedError) {
        tracing::warn!(kind = %self.kind(), error = %error, "subscription terminated");
        if self.errors.try_send(error).is_err() {
            tracing::debug!(kind = %self.kind(), "error already reported, dropping follow-up");
        }
    }

    /// Tear the feed down: report `error` if there is one, then release the
    /// transport exactly once.
    pub async fn finish<F>(self, error: Option<FeedError>, release: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if let Some(error) = error.filter(|e| !e.is_cancelled()) {
            self.fail(error);
        }
        self.handle.close_with(release).await
    }
}

// ─── Consumer half ───────────────────────────────────────────────────────────

/// Consumer end of a feed. Dropping it asks the producer to close.
pub struct Subscription<T> {
    handle: SubscriptionHandle,
    items: mpsc::Receiver<T>,
    errors: mpsc::Receiver<FeedError>,
}

impl<T> Subscription<T> {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.handle.kind()
    }

    pub fn state(&self) -> SubscriptionState {
        self.handle.state()
    }

    /// Wait for the next item.
    ///
    /// Returns [`FeedError::Cancelled`] once cancellation is requested, and the
    /// producer's error (or a `Subscription` error if the producer vanished)
    /// when the feed terminated. Items delivered before an error are returned first.
    pub async fn next(&mut self) -> Result<T, FeedError> {
        let cancel = self.handle.cancel_token().clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FeedError::Cancelled),
            item = self.items.recv() => match item {
                Some(item) => Ok(item),
                None => Err(self.terminal_error()),
            },
            Some(error) = self.errors.recv() => Err(error),
        }
    }

    fn terminal_error(&mut self) -> FeedError {
        self.errors
            .try_recv()
            .unwrap_or_else(|_| FeedError::subscription(self.kind().as_str(), "feed ended"))
    }

    /// Request close and wait until the producer has released the transport.
    pub async fn close(&self) {
        self.handle.request_close();
        self.handle.closed().await;
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.request_close();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("handle", &self.handle).finish()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn state_machine_happy_path() {
        let root = CancellationToken::new();
        let handle = SubscriptionHandle::new(SubscriptionKind::NewHeads, &root);
        assert_eq!(handle.state(), SubscriptionState::Disconnected);
        assert!(!handle.mark_streaming(), "cannot stream before subscribing");
        assert!(handle.mark_subscribing());
        assert!(handle.mark_streaming());
        assert_eq!(handle.state(), SubscriptionState::Streaming);
        assert!(handle.close_with(async {}).await);
        assert_eq!(handle.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn subscribe_failure_returns_to_disconnected() {
        let root = CancellationToken::new();
        let handle = SubscriptionHandle::new(SubscriptionKind::Logs, &root);
        handle.mark_subscribing();
        assert!(handle.mark_failed());
        assert_eq!(handle.state(), SubscriptionState::Disconnected);
    }

    #[tokio::test]
    async fn close_releases_exactly_once() {
        let root = CancellationToken::new();
        let handle = SubscriptionHandle::new(SubscriptionKind::NewHeads, &root);
        let count = AtomicUsize::new(0);
        let releases = &count;
        let release = move || async move {
            releases.fetch_add(1, Ordering::SeqCst);
        };
        assert!(handle.close_with(release()).await);
        assert!(!handle.close_with(release()).await);
        assert!(!handle.close_with(release()).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child_only_downwards() {
        let root = CancellationToken::new();
        let a = SubscriptionHandle::new(SubscriptionKind::NewHeads, &root);
        let b = SubscriptionHandle::new(SubscriptionKind::Logs, &root);
        a.request_close();
        assert!(a.cancel_token().is_cancelled());
        assert!(!b.cancel_token().is_cancelled());
        assert!(!root.is_cancelled());
        root.cancel();
        assert!(b.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn items_arrive_in_order_before_error() {
        let root = CancellationToken::new();
        let (tx, mut rx) = feed::<u64>(SubscriptionKind::NewHeads, &root, FeedConfig::default());
        for n in [10, 11, 12] {
            tx.deliver(n).await.unwrap();
        }
        tx.finish(Some(FeedError::subscription("newHeads", "boom")), async {})
            .await;
        assert_eq!(rx.next().await.unwrap(), 10);
        assert_eq!(rx.next().await.unwrap(), 11);
        assert_eq!(rx.next().await.unwrap(), 12);
        let err = rx.next().await.unwrap_err();
        assert!(matches!(err, FeedError::Subscription { ref reason, .. } if reason == "boom"));
    }

    #[tokio::test]
    async fn cancelled_feed_reports_cancelled() {
        let root = CancellationToken::new();
        let (_tx, mut rx) = feed::<u64>(SubscriptionKind::NewHeads, &root, FeedConfig::default());
        root.cancel();
        assert!(rx.next().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn vanished_producer_is_a_subscription_error() {
        let root = CancellationToken::new();
        let (tx, mut rx) = feed::<u64>(SubscriptionKind::Logs, &root, FeedConfig::default());
        drop(tx);
        assert!(rx.next().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn drop_policy_discards_when_full() {
        let root = CancellationToken::new();
        let config = FeedConfig {
            capacity: 1,
            overflow: OverflowPolicy::Drop,
        };
        let (tx, mut rx) = feed::<u64>(SubscriptionKind::NewHeads, &root, config);
        tx.deliver(1).await.unwrap();
        tx.deliver(2).await.unwrap();
        assert_eq!(rx.next().await.unwrap(), 1);
        drop(tx);
        assert!(rx.next().await.is_err());
    }

    #[tokio::test]
    async fn block_policy_times_out_on_stalled_consumer() {
        let root = CancellationToken::new();
        let config = FeedConfig {
            capacity: 1,
            overflow: OverflowPolicy::Block { timeout_ms: 20 },
        };
        let (tx, _rx) = feed::<u64>(SubscriptionKind::NewHeads, &root, config);
        tx.deliver(1).await.unwrap();
        let err = tx.deliver(2).await.unwrap_err();
        assert!(err.is_fatal(), "stall should be a subscription error: {err}");
    }

    #[tokio::test]
    async fn dropping_consumer_requests_close() {
        let root = CancellationToken::new();
        let (tx, rx) = feed::<u64>(SubscriptionKind::NewHeads, &root, FeedConfig::default());
        assert!(!tx.is_cancelled());
        drop(rx);
        assert!(tx.is_cancelled());
    }
}
