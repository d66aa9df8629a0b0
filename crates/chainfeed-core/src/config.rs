//! Typed configuration records, loaded from YAML.
//!
//! ```yaml
//! chains:
//!   - chain_id: 1
//!     url: https://eth.example.com
//!     stream_url: wss://eth.example.com/ws
//!     blocktime: 12
//!     start_block: 19000000
//!     addresses: ["0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"]
//! logging:
//!   level: 2
//!   format: json
//!   file_path: /var/log/chainfeed.log
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::policy::RetryConfig;
use crate::subscription::{FeedConfig, OverflowPolicy};
use crate::types::{Address, BlockHeight, FilterQuery, Topic};

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(alias = "rpcs")]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// One chain's node endpoints and ingestion starting point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// JSON-RPC over HTTP, used for historic queries.
    pub url: String,
    /// WebSocket endpoint, used for `eth_subscribe` feeds.
    pub stream_url: String,
    /// Expected block time in seconds. Carried but currently unused.
    #[serde(default)]
    pub blocktime: u64,
    /// Last block considered processed when no checkpoint exists.
    #[serde(default)]
    pub start_block: u64,
    /// Contract addresses to follow (empty = all).
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Positional topics to follow (empty = all).
    #[serde(default)]
    pub topics: Vec<String>,
}

impl ChainConfig {
    pub fn start_height(&self) -> BlockHeight {
        BlockHeight::new(self.start_block)
    }

    /// Log filter built from `addresses` and `topics`, ranged at the start block.
    pub fn log_filter(&self) -> Result<FilterQuery, FeedError> {
        let start = self.start_height();
        let mut query = FilterQuery::new(start, start)?;
        for address in &self.addresses {
            query = query.address(address.parse::<Address>()?);
        }
        for topic in &self.topics {
            query = query.topic(topic.parse::<Topic>()?);
        }
        Ok(query)
    }

    fn validate(&self) -> Result<(), FeedError> {
        let http = url::Url::parse(&self.url)
            .map_err(|e| FeedError::Config(format!("chain {}: invalid url: {e}", self.chain_id)))?;
        if !matches!(http.scheme(), "http" | "https") {
            return Err(FeedError::Config(format!(
                "chain {}: url must be http(s), got {}",
                self.chain_id,
                http.scheme()
            )));
        }
        let ws = url::Url::parse(&self.stream_url).map_err(|e| {
            FeedError::Config(format!("chain {}: invalid stream_url: {e}", self.chain_id))
        })?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(FeedError::Config(format!(
                "chain {}: stream_url must be ws(s), got {}",
                self.chain_id,
                ws.scheme()
            )));
        }
        self.log_filter().map(|_| ())
    }
}

/// Logging setup consumed by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 0 = error, 1 = warn, 2 = info, 3 = debug, 4+ = trace.
    #[serde(default = "default_log_level")]
    pub level: u8,
    /// `"json"` or `"text"`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Append logs to this file instead of stderr (empty = stderr).
    #[serde(default)]
    pub file_path: String,
}

fn default_log_level() -> u8 {
    2
}

fn default_log_format() -> String {
    "text".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file_path: String::new(),
        }
    }
}

impl LogConfig {
    /// The `EnvFilter` directive for `level`.
    pub fn directive(&self) -> &'static str {
        match self.level {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Tuning for feeds, backfill, health and restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Buffered items per subscription before the overflow policy applies.
    pub channel_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Deadline for one historic query, all chunks included.
    pub historic_timeout_ms: u64,
    /// Widest block range sent in one `eth_getLogs` call.
    pub max_block_range: u64,
    /// Health turns red when no head arrived within this window.
    pub freshness_window_ms: u64,
    /// Save a checkpoint every N advances of the processed height.
    pub checkpoint_interval: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Dial attempts after the first one before a connection is declared dead.
    pub max_retries: u32,
    /// Consecutive failed ingestion runs before the supervisor gives up.
    pub restart_limit: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
            overflow: OverflowPolicy::default(),
            historic_timeout_ms: 30_000,
            max_block_range: 1_000,
            freshness_window_ms: 60_000,
            checkpoint_interval: 1,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            max_retries: 5,
            restart_limit: 10,
        }
    }
}

impl IngestConfig {
    pub fn feed(&self) -> FeedConfig {
        FeedConfig {
            capacity: self.channel_capacity,
            overflow: self.overflow,
        }
    }

    pub fn historic_timeout(&self) -> Duration {
        Duration::from_millis(self.historic_timeout_ms)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    /// Backoff for re-dialing a WebSocket.
    pub fn reconnect(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
        }
    }

    /// Backoff between supervisor restarts.
    pub fn restart(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.restart_limit,
            ..self.reconnect()
        }
    }

    fn validate(&self) -> Result<(), FeedError> {
        let zero = [
            ("channel_capacity", self.channel_capacity as u64),
            ("historic_timeout_ms", self.historic_timeout_ms),
            ("max_block_range", self.max_block_range),
            ("freshness_window_ms", self.freshness_window_ms),
            ("checkpoint_interval", self.checkpoint_interval),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero {
            return Err(FeedError::Config(format!("ingest.{name} must be greater than zero")));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(FeedError::Config(
                "ingest.initial_backoff_ms exceeds ingest.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Read and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_yaml(&raw)
            .map_err(|e| FeedError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self, FeedError> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| FeedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.chains.is_empty() {
            return Err(FeedError::Config("at least one chain must be configured".into()));
        }
        for chain in &self.chains {
            chain.validate()?;
        }
        self.ingest.validate()
    }

    /// The chain with `chain_id`, or the first configured chain.
    pub fn chain(&self, chain_id: Option<u64>) -> Result<&ChainConfig, FeedError> {
        match chain_id {
            Some(id) => self
                .chains
                .iter()
                .find(|c| c.chain_id == id)
                .ok_or_else(|| FeedError::Config(format!("chain {id} is not configured"))),
            None => self
                .chains
                .first()
                .ok_or_else(|| FeedError::Config("no chains configured".into())),
        }
    }
}
