//! HTTP JSON-RPC client backed by `reqwest`, used for `eth_chainId` and
//! historic `eth_getLogs` queries.
//!
//! Ranges wider than `max_block_range` are fetched as consecutive chunks.
//! A historic query either returns every log of its range or fails as a whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chainfeed_core::{BlockHeight, FeedError, FilterQuery, HistoricQuerier, IngestConfig, LogEvent};

use crate::codec;
use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Timeout of a single HTTP round trip.
    pub request_timeout: Duration,
    /// Timeout of a whole historic query, all chunks included.
    pub historic_timeout: Duration,
    /// Maximum number of blocks per `eth_getLogs` call.
    pub max_block_range: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            historic_timeout: Duration::from_secs(60),
            max_block_range: 2_000,
        }
    }
}

impl From<&IngestConfig> for HttpClientConfig {
    fn from(ingest: &IngestConfig) -> Self {
        Self {
            historic_timeout: ingest.historic_timeout(),
            max_block_range: ingest.max_block_range,
            ..Self::default()
        }
    }
}

/// HTTP JSON-RPC client.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    config: HttpClientConfig,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let resp = self.http.post(&self.url).json(req).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        Ok(resp.json::<JsonRpcResponse>().await?)
    }

    fn request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, req: JsonRpcRequest) -> Result<Value, TransportError> {
        let method = req.method.clone();
        let result = self
            .send_once(&req)
            .await?
            .into_result()
            .map_err(TransportError::Rpc);
        if let Err(e) = &result {
            tracing::debug!(url = %self.url, method = %method, error = %e, "rpc call failed");
        }
        result
    }

    /// `eth_chainId`.
    pub async fn chain_id(&self) -> Result<u64, TransportError> {
        let result = self.call(JsonRpcRequest::chain_id(self.request_id())).await?;
        codec::quantity(&result, "chainId")
    }

    /// All logs of `query`'s range, chunk by chunk.
    pub async fn get_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, TransportError> {
        let mut all_logs = Vec::new();
        for (from, to) in chunk_ranges(query.from_block(), query.to_block(), self.config.max_block_range) {
            let chunk = query
                .with_range(from, to)
                .map_err(|e| TransportError::UnexpectedResponse(e.to_string()))?;
            let result = self
                .call(JsonRpcRequest::get_logs(self.request_id(), &chunk))
                .await?;
            let logs = codec::log_list(result)?;
            tracing::trace!(from = %from, to = %to, count = logs.len(), "eth_getLogs chunk");
            all_logs.extend(logs);
        }
        Ok(all_logs)
    }
}

#[async_trait]
impl HistoricQuerier for HttpRpcClient {
    async fn query_historic_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, FeedError> {
        let (from, to) = (query.from_block(), query.to_block());
        let timeout = self.config.historic_timeout;
        match tokio::time::timeout(timeout, self.get_logs(query)).await {
            Ok(Ok(logs)) => {
                tracing::debug!(from = %from, to = %to, count = logs.len(), "historic query complete");
                Ok(logs)
            }
            Ok(Err(e)) => Err(e.into_historic(from, to)),
            Err(_) => Err(TransportError::Timeout {
                ms: timeout.as_millis() as u64,
            }
            .into_historic(from, to)),
        }
    }
}

/// Split `[from, to]` into consecutive inclusive chunks of at most `max_range` blocks.
pub fn chunk_ranges(from: BlockHeight, to: BlockHeight, max_range: u64) -> Vec<(BlockHeight, BlockHeight)> {
    let (from, to) = (from.get(), to.get());
    if to < from {
        return vec![];
    }
    let step = max_range.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    loop {
        let end = start.saturating_add(step - 1).min(to);
        chunks.push((BlockHeight::new(start), BlockHeight::new(end)));
        if end == to {
            break;
        }
        start = end + 1;
    }
    chunks
}
