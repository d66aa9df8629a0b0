//! Transport-level error types.

use chainfeed_core::{BlockHeight, FeedError, SubscriptionKind};
use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to a node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The node answered with something that is not what was asked for.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl TransportError {
    pub fn into_dial(self, url: &str) -> FeedError {
        FeedError::Dial {
            url: url.to_string(),
            reason: self.to_string(),
        }
    }

    pub fn into_subscription(self, kind: SubscriptionKind) -> FeedError {
        FeedError::subscription(kind.as_str(), self.to_string())
    }

    pub fn into_historic(self, from: BlockHeight, to: BlockHeight) -> FeedError {
        FeedError::HistoricQuery {
            from,
            to,
            reason: self.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
