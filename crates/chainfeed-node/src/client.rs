//! The production [`chainfeed_core::NodeConnection`]: WebSocket feeds plus HTTP history.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use chainfeed_core::{
    BlockHeight, ChainConfig, FeedError, FilterQuery, HeadSubscriber, HistoricQuerier,
    IngestConfig, LogEvent, LogSubscriber, Subscription,
};

use crate::http::{HttpClientConfig, HttpRpcClient};
use crate::ws::{WsClientConfig, WsSubscriber};

/// Connection to one chain's node.
pub struct NodeClient {
    chain_id: u64,
    http: HttpRpcClient,
    ws: WsSubscriber,
}

impl NodeClient {
    /// Build both transports and check that the HTTP endpoint serves `chain.chain_id`.
    ///
    /// An unreachable node is a [`FeedError::Dial`]; a node on another chain is
    /// a [`FeedError::Config`]. WebSocket connections are dialed per subscription.
    pub async fn connect(chain: &ChainConfig, ingest: &IngestConfig) -> Result<Self, FeedError> {
        let http = HttpRpcClient::new(chain.url.clone(), HttpClientConfig::from(ingest))
            .map_err(|e| e.into_dial(&chain.url))?;
        let reported = http.chain_id().await.map_err(|e| e.into_dial(&chain.url))?;
        if reported != chain.chain_id {
            return Err(FeedError::Config(format!(
                "node at {} serves chain {reported}, configured chain is {}",
                chain.url, chain.chain_id
            )));
        }
        tracing::info!(
            chain_id = chain.chain_id,
            url = %chain.url,
            stream_url = %chain.stream_url,
            "connected to node"
        );
        Ok(Self {
            chain_id: chain.chain_id,
            http,
            ws: WsSubscriber::new(chain.stream_url.clone(), WsClientConfig::from(ingest)),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

#[async_trait]
impl HeadSubscriber for NodeClient {
    async fn subscribe_heads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<BlockHeight>, FeedError> {
        self.ws.subscribe_heads(cancel).await
    }
}

#[async_trait]
impl LogSubscriber for NodeClient {
    async fn subscribe_logs(
        &self,
        query: &FilterQuery,
        cancel: &CancellationToken,
    ) -> Result<Subscription<LogEvent>, FeedError> {
        self.ws.subscribe_logs(query, cancel).await
    }
}

#[async_trait]
impl HistoricQuerier for NodeClient {
    async fn query_historic_logs(&self, query: &FilterQuery) -> Result<Vec<LogEvent>, FeedError> {
        self.http.query_historic_logs(query).await
    }
}
