//! chainfeed-node: JSON-RPC node connection for ChainFeed.
//!
//! - [`WsSubscriber`]: `eth_subscribe` feeds, one WebSocket per subscription
//! - [`HttpRpcClient`]: `eth_chainId` and chunked `eth_getLogs`
//! - [`NodeClient`]: both behind the [`chainfeed_core::NodeConnection`] capabilities

pub mod client;
pub mod codec;
pub mod error;
pub mod http;
pub mod request;
pub mod ws;

pub use client::NodeClient;
pub use error::TransportError;
pub use http::{HttpClientConfig, HttpRpcClient};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use ws::{dial_with_retry, WsClientConfig, WsSubscriber};
