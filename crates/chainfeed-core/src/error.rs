//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::types::BlockHeight;

/// Errors surfaced by the node connection layer and the block processor.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// A connection to the node could not be established.
    #[error("failed to connect to {url}: {reason}")]
    Dial { url: String, reason: String },

    /// An open subscription failed mid-stream and was torn down.
    #[error("{kind} subscription failed: {reason}")]
    Subscription { kind: String, reason: String },

    /// The node reported a head below the one already tracked.
    #[error("head {received} is below the tracked head {current}")]
    OutOfOrderHeight {
        current: BlockHeight,
        received: BlockHeight,
    },

    /// A historic range query did not complete.
    #[error("historic query for blocks {from}..={to} failed: {reason}")]
    HistoricQuery {
        from: BlockHeight,
        to: BlockHeight,
        reason: String,
    },

    /// Graceful shutdown was requested.
    #[error("cancelled")]
    Cancelled,

    /// The checkpoint store could not be read or written.
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl FeedError {
    pub fn subscription(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Subscription {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for a graceful shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the error ends the current ingestion task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Dial { .. } | Self::Subscription { .. })
    }

    /// Returns `true` if ingestion can carry on and retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::HistoricQuery { .. } | Self::OutOfOrderHeight { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let cancelled = FeedError::Cancelled;
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_fatal());
        assert!(!cancelled.is_recoverable());

        let sub = FeedError::subscription("newHeads", "socket reset");
        assert!(sub.is_fatal());
        assert_eq!(sub.to_string(), "newHeads subscription failed: socket reset");

        let ooo = FeedError::OutOfOrderHeight {
            current: BlockHeight::new(12),
            received: BlockHeight::new(11),
        };
        assert!(ooo.is_recoverable());
        assert!(!ooo.is_fatal());
    }
}
