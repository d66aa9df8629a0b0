//! chainfeed-core: domain types and node capabilities for ChainFeed.
//!
//! # Overview
//!
//! ChainFeed keeps a consumer continuously up to date with an EVM chain's
//! blocks and logs: it subscribes to new heads and back-fills whatever range
//! was missed while it was offline. The core crate defines:
//!
//! - [`BlockHeight`], [`FilterQuery`], [`LogEvent`]: domain values
//! - [`HeadSubscriber`] / [`LogSubscriber`] / [`HistoricQuerier`]: what a node connection can do
//! - [`Subscription`] / [`SubscriptionHandle`]: streaming feeds with a close-once lifecycle
//! - [`FeedError`]: structured error type
//! - [`config`] module: YAML application configuration
//! - [`policy`] module: reconnect / restart backoff

pub mod config;
pub mod error;
pub mod node;
pub mod policy;
pub mod subscription;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{AppConfig, ChainConfig, IngestConfig, LogConfig};
pub use error::FeedError;
pub use node::{HeadSubscriber, HistoricQuerier, LogSubscriber, NodeConnection};
pub use policy::{Backoff, RetryConfig, RetryPolicy};
pub use subscription::{
    feed, FeedConfig, FeedSender, OverflowPolicy, Subscription, SubscriptionHandle,
    SubscriptionKind, SubscriptionState,
};
pub use types::{Address, BlockHeight, FilterQuery, LogEvent, Topic};
