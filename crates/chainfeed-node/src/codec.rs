//! Decoding of node messages: subscription notifications, headers and logs.

use chainfeed_core::{BlockHeight, LogEvent};
use serde_json::Value;

use crate::error::TransportError;
use crate::request::JsonRpcResponse;

/// A text frame received on a subscription socket.
#[derive(Debug)]
pub enum Incoming {
    /// `eth_subscription` push for `subscription`.
    Notification { subscription: String, result: Value },
    /// Answer to a request we sent.
    Response(JsonRpcResponse),
}

/// Classify a text frame.
pub fn parse_incoming(text: &str) -> Result<Incoming, TransportError> {
    let mut val: Value = serde_json::from_str(text)?;
    if val.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        let params = val
            .get_mut("params")
            .map(Value::take)
            .ok_or_else(|| TransportError::UnexpectedResponse("notification without params".into()))?;
        let subscription = params["subscription"]
            .as_str()
            .ok_or_else(|| TransportError::UnexpectedResponse("notification without subscription id".into()))?
            .to_string();
        let result = params.get("result").cloned().unwrap_or(Value::Null);
        return Ok(Incoming::Notification { subscription, result });
    }
    Ok(Incoming::Response(serde_json::from_value(val)?))
}

/// Parse a hex quantity field.
pub fn quantity(value: &Value, field: &str) -> Result<u64, TransportError> {
    let raw = value
        .as_str()
        .ok_or_else(|| TransportError::UnexpectedResponse(format!("{field} is not a hex string: {value}")))?;
    BlockHeight::from_hex(raw)
        .map(BlockHeight::get)
        .map_err(|e| TransportError::UnexpectedResponse(format!("{field}: {e}")))
}

/// Height of a `newHeads` header.
pub fn head_height(header: Value) -> Result<BlockHeight, TransportError> {
    quantity(&header["number"], "number").map(BlockHeight::new)
}

/// Wrap a raw log; only `blockNumber` is interpreted.
pub fn log_event(log: Value) -> Result<LogEvent, TransportError> {
    let block = quantity(&log["blockNumber"], "blockNumber")?;
    Ok(LogEvent::new(BlockHeight::new(block), log))
}

/// The subscription id returned by `eth_subscribe`.
pub fn subscription_id(result: &Value) -> Result<String, TransportError> {
    result
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TransportError::UnexpectedResponse(format!("eth_subscribe returned {result}")))
}

/// Decode an `eth_getLogs` result array.
pub fn log_list(result: Value) -> Result<Vec<LogEvent>, TransportError> {
    match result {
        Value::Array(logs) => logs.into_iter().map(log_event).collect(),
        other => Err(TransportError::UnexpectedResponse(format!(
            "eth_getLogs returned {other}"
        ))),
    }
}
