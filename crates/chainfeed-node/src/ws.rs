//! WebSocket `eth_subscribe` feeds.
//!
//! Every subscription owns its own connection and a background pump task:
//!
//! ```text
//! dial (with backoff) → eth_subscribe → ack → Streaming
//!   pump: notification → decode → FeedSender::deliver
//!   exit: eth_unsubscribe + close frame, exactly once
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use chainfeed_core::{
    feed, BlockHeight, FeedConfig, FeedError, FeedSender, FilterQuery, HeadSubscriber,
    IngestConfig, LogEvent, LogSubscriber, RetryConfig, RetryPolicy, Subscription,
    SubscriptionKind,
};

use crate::codec::{self, Incoming};
use crate::error::TransportError;
use crate::request::{JsonRpcRequest, RpcId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIBE_ID: u64 = 1;
const UNSUBSCRIBE_ID: u64 = 2;
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket subscriber.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Backoff between dial attempts.
    pub reconnect: RetryConfig,
    pub feed: FeedConfig,
    /// Deadline for the `eth_subscribe` acknowledgement.
    pub handshake_timeout: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect: RetryConfig::default(),
            feed: FeedConfig::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&IngestConfig> for WsClientConfig {
    fn from(ingest: &IngestConfig) -> Self {
        Self {
            reconnect: ingest.reconnect(),
            feed: ingest.feed(),
            ..Self::default()
        }
    }
}

/// Opens head and log subscriptions against one WebSocket endpoint.
pub struct WsSubscriber {
    url: String,
    config: WsClientConfig,
}

impl WsSubscriber {
    pub fn new(url: impl Into<String>, config: WsClientConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open<T: Send + 'static>(
        &self,
        kind: SubscriptionKind,
        filter: Option<&FilterQuery>,
        cancel: &CancellationToken,
        decode: fn(Value) -> Result<T, TransportError>,
    ) -> Result<Subscription<T>, FeedError> {
        let (tx, sub) = feed(kind, cancel, self.config.feed);
        let handle = tx.handle().clone();
        handle.mark_subscribing();

        let mut ws = match dial_with_retry(&self.url, &self.config.reconnect, handle.cancel_token()).await {
            Ok(ws) => ws,
            Err(e) => {
                handle.mark_failed();
                return Err(e);
            }
        };

        let ack = tokio::select! {
            biased;
            _ = handle.cancel_token().cancelled() => Err(FeedError::Cancelled),
            ack = tokio::time::timeout(self.config.handshake_timeout, subscribe(&mut ws, kind, filter)) => match ack {
                Ok(Ok(id)) => Ok(id),
                Ok(Err(e)) => Err(e.into_subscription(kind)),
                Err(_) => Err(TransportError::Timeout {
                    ms: self.config.handshake_timeout.as_millis() as u64,
                }
                .into_subscription(kind)),
            },
        };
        let sub_id = match ack {
            Ok(id) => id,
            Err(e) => {
                handle.mark_failed();
                let _ = ws.close(None).await;
                return Err(e);
            }
        };

        handle.mark_streaming();
        tracing::info!(url = %self.url, kind = %kind, subscription = %sub_id, "subscription streaming");
        tokio::spawn(pump(ws, sub_id, tx, decode));
        Ok(sub)
    }
}

#[async_trait]
impl HeadSubscriber for WsSubscriber {
    async fn subscribe_heads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<BlockHeight>, FeedError> {
        self.open(SubscriptionKind::NewHeads, None, cancel, codec::head_height)
            .await
    }
}

#[async_trait]
impl LogSubscriber for WsSubscriber {
    async fn subscribe_logs(
        &self,
        query: &FilterQuery,
        cancel: &CancellationToken,
    ) -> Result<Subscription<LogEvent>, FeedError> {
        self.open(SubscriptionKind::Logs, Some(query), cancel, codec::log_event)
            .await
    }
}

/// Connect to `url`, backing off between failures.
///
/// Fails with [`FeedError::Dial`] once retries are exhausted and with
/// [`FeedError::Cancelled`] if `cancel` fires first.
pub async fn dial_with_retry(
    url: &str,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<WsStream, FeedError> {
    let mut backoff = RetryPolicy::new(retry.clone()).backoff();
    loop {
        tracing::debug!(url = %url, "connecting via WebSocket");
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FeedError::Cancelled),
            conn = tokio_tungstenite::connect_async(url) => conn,
        };
        let err = match conn {
            Ok((ws, _)) => return Ok(ws),
            Err(e) => TransportError::from(e),
        };
        tracing::warn!(url = %url, attempt = backoff.attempts() + 1, error = %err, "WS connect failed");
        if !backoff.wait(cancel).await {
            if cancel.is_cancelled() {
                return Err(FeedError::Cancelled);
            }
            return Err(err.into_dial(url));
        }
    }
}

async fn send_request(ws: &mut WsStream, req: &JsonRpcRequest) -> Result<(), TransportError> {
    let text = serde_json::to_string(req)?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Send `eth_subscribe` and wait for its acknowledgement.
async fn subscribe(
    ws: &mut WsStream,
    kind: SubscriptionKind,
    filter: Option<&FilterQuery>,
) -> Result<String, TransportError> {
    send_request(ws, &JsonRpcRequest::subscribe(SUBSCRIBE_ID, kind, filter)).await?;
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match codec::parse_incoming(text.as_str())? {
                Incoming::Response(resp) if resp.id == RpcId::Number(SUBSCRIBE_ID) => {
                    let result = resp.into_result().map_err(TransportError::Rpc)?;
                    return codec::subscription_id(&result);
                }
                other => tracing::trace!(?other, "ignoring frame before subscription ack"),
            },
            Message::Close(frame) => {
                return Err(TransportError::WebSocket(format!(
                    "connection closed during subscribe: {frame:?}"
                )))
            }
            _ => {}
        }
    }
    Err(TransportError::WebSocket(
        "connection closed during subscribe".into(),
    ))
}

/// Forward notifications until cancellation or failure, then release the connection.
async fn pump<T>(
    mut ws: WsStream,
    sub_id: String,
    tx: FeedSender<T>,
    decode: fn(Value) -> Result<T, TransportError>,
) {
    let outcome = stream_notifications(&mut ws, &sub_id, &tx, decode).await;
    let kind = tx.kind();
    tx.finish(outcome, async move {
        let release = async {
            if let Err(e) = send_request(&mut ws, &JsonRpcRequest::unsubscribe(UNSUBSCRIBE_ID, &sub_id)).await {
                tracing::debug!(kind = %kind, error = %e, "eth_unsubscribe not sent");
            }
            if let Err(e) = ws.close(None).await {
                tracing::debug!(kind = %kind, error = %e, "close frame not sent");
            }
        };
        if tokio::time::timeout(RELEASE_TIMEOUT, release).await.is_err() {
            tracing::warn!(kind = %kind, "timed out releasing WebSocket connection");
        }
    })
    .await;
}

/// `None` means the feed was cancelled.
async fn stream_notifications<T>(
    ws: &mut WsStream,
    sub_id: &str,
    tx: &FeedSender<T>,
    decode: fn(Value) -> Result<T, TransportError>,
) -> Option<FeedError> {
    let kind = tx.kind();
    loop {
        let msg = tokio::select! {
            biased;
            _ = tx.cancelled() => return None,
            msg = ws.next() => msg,
        };
        let text = match msg {
            None => {
                return Some(TransportError::WebSocket("connection closed by node".into()).into_subscription(kind))
            }
            Some(Err(e)) => return Some(TransportError::from(e).into_subscription(kind)),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                return Some(
                    TransportError::WebSocket(format!("node closed the connection: {frame:?}"))
                        .into_subscription(kind),
                )
            }
            // Pings are answered by tungstenite on the next read.
            Some(Ok(_)) => continue,
        };
        let item = match codec::parse_incoming(text.as_str()) {
            Ok(Incoming::Notification { subscription, result }) if subscription == sub_id => decode(result),
            Ok(other) => {
                tracing::trace!(?other, "ignoring unrelated frame");
                continue;
            }
            Err(e) => Err(e),
        };
        match item {
            Ok(item) => {
                if let Err(e) = tx.deliver(item).await {
                    return Some(e);
                }
            }
            Err(e) => return Some(e.into_subscription(kind)),
        }
    }
}
