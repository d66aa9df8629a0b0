//! Shared types for the ingestion pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FeedError;

// ─── BlockHeight ──────────────────────────────────────────────────────────────

/// Position of a block in the chain, genesis = 0.
///
/// Ordered, so it doubles as the ingestion cursor type. Arithmetic is checked:
/// `next`/`prev` return `None` instead of wrapping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockHeight(u64);

impl BlockHeight {
    /// The genesis block.
    pub const GENESIS: Self = Self(0);

    pub const fn new(number: u64) -> Self {
        Self(number)
    }

    /// The raw block number.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following height, or `None` at `u64::MAX`.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// The preceding height, or `None` at genesis.
    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }

    /// Number of heights strictly between `self` and `other` (`0` if adjacent or reversed).
    pub fn blocks_between(self, other: Self) -> u64 {
        other.0.saturating_sub(self.0).saturating_sub(1)
    }

    /// JSON-RPC quantity encoding (`0x`-prefixed, no leading zeros).
    pub fn to_hex(self) -> String {
        format!("0x{:x}", self.0)
    }

    /// Parse a JSON-RPC quantity (with or without `0x`).
    pub fn from_hex(s: &str) -> Result<Self, FeedError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() {
            return Err(FeedError::Other(format!("empty block number quantity: {s:?}")));
        }
        u64::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|e| FeedError::Other(format!("invalid block number {s:?}: {e}")))
    }
}

impl From<u64> for BlockHeight {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Address / Topic ─────────────────────────────────────────────────────────

fn normalize_hex(value: &str, bytes: usize, what: &str) -> Result<String, FeedError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| FeedError::Config(format!("{what} must be 0x-prefixed: {value:?}")))?;
    if digits.len() != bytes * 2 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FeedError::Config(format!(
            "{what} must be {bytes} hex-encoded bytes: {value:?}"
        )));
    }
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

/// A 20-byte contract address, stored lowercase `0x…`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_hex(s, 20, "address").map(Self)
    }
}

impl TryFrom<String> for Address {
    type Error = FeedError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 32-byte log topic (e.g. an event signature hash), stored lowercase `0x…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_hex(s, 32, "topic").map(Self)
    }
}

impl TryFrom<String> for Topic {
    type Error = FeedError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── FilterQuery ─────────────────────────────────────────────────────────────

/// Selects log events by contract address, positional topics and an inclusive block range.
///
/// Live subscriptions only use `addresses` and `topics`; the range is consulted by
/// historic queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQuery {
    /// Contract addresses (empty = any address).
    pub addresses: BTreeSet<Address>,
    /// Positional topics, `topics[0]` is usually the event signature (empty = any).
    pub topics: Vec<Topic>,
    from_block: BlockHeight,
    to_block: BlockHeight,
}

impl FilterQuery {
    /// Create an unfiltered query over `[from, to]`.
    pub fn new(from: BlockHeight, to: BlockHeight) -> Result<Self, FeedError> {
        if from > to {
            return Err(FeedError::HistoricQuery {
                from,
                to,
                reason: "fromBlock is above toBlock".into(),
            });
        }
        Ok(Self {
            addresses: BTreeSet::new(),
            topics: Vec::new(),
            from_block: from,
            to_block: to,
        })
    }

    /// Add a contract address.
    pub fn address(mut self, address: Address) -> Self {
        self.addresses.insert(address);
        self
    }

    /// Append a positional topic.
    pub fn topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    /// Same address/topic selection over a different range.
    pub fn with_range(&self, from: BlockHeight, to: BlockHeight) -> Result<Self, FeedError> {
        let mut q = Self::new(from, to)?;
        q.addresses = self.addresses.clone();
        q.topics = self.topics.clone();
        Ok(q)
    }

    pub fn from_block(&self) -> BlockHeight {
        self.from_block
    }

    pub fn to_block(&self) -> BlockHeight {
        self.to_block
    }

    /// Number of blocks covered by the range.
    pub fn block_count(&self) -> u64 {
        self.to_block.get() - self.from_block.get() + 1
    }

    /// Returns `true` if neither addresses nor topics restrict the selection.
    pub fn is_unfiltered(&self) -> bool {
        self.addresses.is_empty() && self.topics.is_empty()
    }
}

// ─── LogEvent ────────────────────────────────────────────────────────────────

/// A log notification: its block plus the node's payload, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub block_number: BlockHeight,
    pub payload: Value,
}

impl LogEvent {
    pub fn new(block_number: BlockHeight, payload: Value) -> Self {
        Self {
            block_number,
            payload,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_height_hex() {
        assert_eq!(BlockHeight::new(255).to_hex(), "0xff");
        assert_eq!(BlockHeight::from_hex("0x12a05f200").unwrap().get(), 5_000_000_000);
        assert_eq!(BlockHeight::from_hex("1234").unwrap().get(), 0x1234);
        assert!(BlockHeight::from_hex("0x").is_err());
        assert!(BlockHeight::from_hex("0xzz").is_err());
    }

    #[test]
    fn block_height_neighbours() {
        assert_eq!(BlockHeight::GENESIS.prev(), None);
        assert_eq!(BlockHeight::new(u64::MAX).next(), None);
        assert_eq!(BlockHeight::new(100).blocks_between(BlockHeight::new(105)), 4);
        assert_eq!(BlockHeight::new(104).blocks_between(BlockHeight::new(105)), 0);
        assert_eq!(BlockHeight::new(110).blocks_between(BlockHeight::new(105)), 0);
    }

    #[test]
    fn address_is_normalized() {
        let a: Address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap();
        assert_eq!(a.as_str(), "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert!("0x1234".parse::<Address>().is_err());
        assert!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".parse::<Address>().is_err());
    }

    #[test]
    fn filter_query_rejects_reversed_range() {
        let err = FilterQuery::new(BlockHeight::new(10), BlockHeight::new(9)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn filter_query_with_range_keeps_selection() {
        let topic: Topic =
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".parse().unwrap();
        let q = FilterQuery::new(BlockHeight::new(1), BlockHeight::new(1))
            .unwrap()
            .topic(topic.clone());
        let moved = q.with_range(BlockHeight::new(51), BlockHeight::new(59)).unwrap();
        assert_eq!(moved.topics, vec![topic]);
        assert_eq!(moved.block_count(), 9);
        assert!(!moved.is_unfiltered());
    }
}
