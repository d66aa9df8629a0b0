//! Liveness of the ingestion task.
//!
//! Healthy iff a head arrived within the freshness window and no subscription
//! failure is outstanding. A failure is cleared by the next head.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use chainfeed_core::{BlockHeight, FeedError};

/// Point-in-time health of a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub last_head: Option<BlockHeight>,
    /// Time since the last head.
    pub head_age: Option<Duration>,
    /// Outstanding subscription failure, if any.
    pub error: Option<String>,
    /// Heads rejected for going backwards.
    pub out_of_order_heads: u64,
    /// Heads at or below the processed height, ignored until the node catches up.
    pub heads_behind: u64,
    pub failed_backfills: u64,
}

#[derive(Debug, Default)]
struct Inner {
    last_head: Option<(BlockHeight, Instant)>,
    error: Option<String>,
    out_of_order_heads: u64,
    heads_behind: u64,
    failed_backfills: u64,
}

/// Cloneable health handle shared by the processor and its observers.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    freshness_window: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl HealthMonitor {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            freshness_window,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn record_head(&self, height: BlockHeight) {
        self.with(|i| {
            i.last_head = Some((height, Instant::now()));
            i.error = None;
        });
    }

    pub fn record_error(&self, error: &FeedError) {
        self.with(|i| i.error = Some(error.to_string()));
    }

    pub fn record_out_of_order(&self) {
        self.with(|i| i.out_of_order_heads += 1);
    }

    pub fn record_head_behind(&self) {
        self.with(|i| i.heads_behind += 1);
    }

    pub fn record_failed_backfill(&self) {
        self.with(|i| i.failed_backfills += 1);
    }

    pub fn report(&self) -> HealthReport {
        self.with(|i| {
            let head_age = i.last_head.map(|(_, at)| at.elapsed());
            let fresh = head_age.is_some_and(|age| age <= self.freshness_window);
            HealthReport {
                healthy: fresh && i.error.is_none(),
                last_head: i.last_head.map(|(h, _)| h),
                head_age,
                error: i.error.clone(),
                out_of_order_heads: i.out_of_order_heads,
                heads_behind: i.heads_behind,
                failed_backfills: i.failed_backfills,
            }
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.report().healthy
    }
}
