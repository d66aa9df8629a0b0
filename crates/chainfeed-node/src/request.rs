//! JSON-RPC 2.0 wire types and the handful of Ethereum methods ChainFeed calls.

use chainfeed_core::{FilterQuery, SubscriptionKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }

    pub fn chain_id(id: u64) -> Self {
        Self::new(id, "eth_chainId", vec![])
    }

    /// `eth_subscribe`; a `logs` subscription carries the address/topic filter.
    pub fn subscribe(id: u64, kind: SubscriptionKind, filter: Option<&FilterQuery>) -> Self {
        let mut params = vec![Value::String(kind.as_str().into())];
        if let Some(filter) = filter {
            params.push(Value::Object(filter_object(filter)));
        }
        Self::new(id, "eth_subscribe", params)
    }

    pub fn unsubscribe(id: u64, subscription: &str) -> Self {
        Self::new(id, "eth_unsubscribe", vec![Value::String(subscription.into())])
    }

    /// `eth_getLogs` over the query's inclusive range.
    pub fn get_logs(id: u64, query: &FilterQuery) -> Self {
        let mut filter = filter_object(query);
        filter.insert("fromBlock".into(), json!(query.from_block().to_hex()));
        filter.insert("toBlock".into(), json!(query.to_block().to_hex()));
        Self::new(id, "eth_getLogs", vec![Value::Object(filter)])
    }
}

/// The `{address, topics}` part of an Ethereum log filter. Empty selections
/// are omitted so the node treats them as wildcards.
fn filter_object(query: &FilterQuery) -> Map<String, Value> {
    let mut filter = Map::new();
    if !query.addresses.is_empty() {
        let addresses: Vec<&str> = query.addresses.iter().map(|a| a.as_str()).collect();
        filter.insert("address".into(), json!(addresses));
    }
    if !query.topics.is_empty() {
        let topics: Vec<&str> = query.topics.iter().map(|t| t.as_str()).collect();
        filter.insert("topics".into(), json!(topics));
    }
    filter
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result value or return an error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}
