//! Reconnect/restart policy.
//!
//! Used by the WebSocket dialer (reconnect before declaring a connection dead)
//! and by the processor supervisor (restart a failed ingestion task).

pub mod retry;

pub use retry::{Backoff, RetryConfig, RetryPolicy};
