//! Capabilities of the node connection layer.
//!
//! The block processor is generic over [`NodeConnection`], so a production
//! client and the test doubles in [`crate::testing`] are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::subscription::Subscription;
use crate::types::{BlockHeight, FilterQuery, LogEvent};

/// Push feed of new block headers, reduced to their heights.
#[async_trait]
pub trait HeadSubscriber: Send + Sync + 'static {
    /// Open a head subscription.
    ///
    /// Heights are delivered in the order the node sent them. A transport
    /// failure ends the feed with [`FeedError::Subscription`]; cancelling
    /// `cancel` unsubscribes and closes the connection exactly once.
    async fn subscribe_heads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<BlockHeight>, FeedError>;
}

/// Push feed of log events matching a filter.
#[async_trait]
pub trait LogSubscriber: Send + Sync + 'static {
    /// Open a log subscription. Only the address/topic part of `query` is used.
    async fn subscribe_logs(
        &self,
        query: &FilterQuery,
        cancel: &CancellationToken,
    ) -> Result<Subscription<LogEvent>, FeedError>;
}

/// Bounded request/response retrieval of past logs.
#[async_trait]
pub trait HistoricQuerier: Send + Sync + 'static {
    /// Fetch every log in `query`'s range, or fail with
    /// [`FeedError::HistoricQuery`] without partial results.
    async fn query_historic_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, FeedError>;
}

/// The full capability set the block processor needs.
pub trait NodeConnection: HeadSubscriber + LogSubscriber + HistoricQuerier {}

impl<T> NodeConnection for T where T: HeadSubscriber + LogSubscriber + HistoricQuerier {}

#[async_trait]
impl<T: HeadSubscriber + ?Sized> HeadSubscriber for Arc<T> {
    async fn subscribe_heads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<BlockHeight>, FeedError> {
        (**self).subscribe_heads(cancel).await
    }
}

#[async_trait]
impl<T: LogSubscriber + ?Sized> LogSubscriber for Arc<T> {
    async fn subscribe_logs(
        &self,
        query: &FilterQuery,
        cancel: &CancellationToken,
    ) -> Result<Subscription<LogEvent>, FeedError> {
        (**self).subscribe_logs(query, cancel).await
    }
}

#[async_trait]
impl<T: HistoricQuerier + ?Sized> HistoricQuerier for Arc<T> {
    async fn query_historic_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, FeedError> {
        (**self).query_historic_logs(query).await
    }
}
