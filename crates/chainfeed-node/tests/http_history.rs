//! Historic query and connect probe tests against an in-process JSON-RPC stub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use chainfeed_core::{
    BlockHeight, ChainConfig, FeedError, FilterQuery, HistoricQuerier, IngestConfig,
};
use chainfeed_node::{HttpClientConfig, HttpRpcClient, NodeClient};

// ─── Helpers ──────────────────────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

async fn read_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return Vec::new();
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let len = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map(|v| v.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        if buf.len() >= end + 4 + len {
            return buf[end + 4..end + 4 + len].to_vec();
        }
    }
}

/// Answer every request with `handler`'s result, one connection at a time.
async fn serve(listener: TcpListener, handler: Handler) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let body = read_body(&mut stream).await;
        let Ok(req) = serde_json::from_slice::<Value>(&body) else {
            continue;
        };
        let reply = handler(&req);
        let mut resp = json!({ "jsonrpc": "2.0", "id": req["id"] });
        if reply.get("code").is_some() {
            resp["error"] = reply;
        } else {
            resp["result"] = reply;
        }
        let resp = resp.to_string();
        let raw = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            resp.len(),
            resp
        );
        let _ = stream.write_all(raw.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
}

async fn stub(handler: Handler) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, handler));
    url
}

fn hex(v: &Value) -> u64 {
    BlockHeight::from_hex(v.as_str().unwrap()).unwrap().get()
}

/// `eth_getLogs` answering one log per block; records the requested ranges.
fn logs_handler(ranges: Arc<Mutex<Vec<(u64, u64)>>>, fail_from: Option<u64>) -> Handler {
    Arc::new(move |req: &Value| {
        let filter = &req["params"][0];
        let (from, to) = (hex(&filter["fromBlock"]), hex(&filter["toBlock"]));
        ranges.lock().unwrap().push((from, to));
        if fail_from == Some(from) {
            return json!({ "code": -32005, "message": "limit exceeded" });
        }
        Value::Array(
            (from..=to)
                .map(|n| json!({ "blockNumber": format!("0x{n:x}"), "data": "0x" }))
                .collect(),
        )
    })
}

fn query(from: u64, to: u64) -> FilterQuery {
    FilterQuery::new(BlockHeight::new(from), BlockHeight::new(to)).unwrap()
}

fn chunked(max_block_range: u64) -> HttpClientConfig {
    HttpClientConfig {
        max_block_range,
        historic_timeout: Duration::from_secs(5),
        ..HttpClientConfig::default()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn wide_range_is_fetched_in_chunks() {
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let url = stub(logs_handler(Arc::clone(&ranges), None)).await;
    let client = HttpRpcClient::new(url, chunked(4)).unwrap();

    let logs = client.query_historic_logs(&query(1, 10)).await.unwrap();

    let blocks: Vec<u64> = logs.iter().map(|l| l.block_number.get()).collect();
    assert_eq!(blocks, (1..=10).collect::<Vec<_>>());
    assert_eq!(*ranges.lock().unwrap(), vec![(1, 4), (5, 8), (9, 10)]);
}

#[tokio::test]
async fn failing_chunk_fails_the_whole_query() {
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let url = stub(logs_handler(Arc::clone(&ranges), Some(5))).await;
    let client = HttpRpcClient::new(url, chunked(4)).unwrap();

    let err = client.query_historic_logs(&query(1, 10)).await.unwrap_err();
    match err {
        FeedError::HistoricQuery { from, to, reason } => {
            assert_eq!((from.get(), to.get()), (1, 10));
            assert!(reason.contains("limit exceeded"), "{reason}");
        }
        other => panic!("expected HistoricQuery, got {other}"),
    }
    assert_eq!(ranges.lock().unwrap().len(), 2, "no chunk after the failure");
}

#[tokio::test]
async fn slow_node_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    // Accept and never answer.
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let config = HttpClientConfig {
        historic_timeout: Duration::from_millis(100),
        ..HttpClientConfig::default()
    };
    let client = HttpRpcClient::new(url, config).unwrap();
    let err = client.query_historic_logs(&query(51, 59)).await.unwrap_err();
    assert!(matches!(err, FeedError::HistoricQuery { .. }), "got {err}");
}

fn chain(url: &str, chain_id: u64) -> ChainConfig {
    ChainConfig {
        chain_id,
        url: url.to_string(),
        stream_url: "ws://127.0.0.1:1".into(),
        blocktime: 12,
        start_block: 0,
        addresses: vec![],
        topics: vec![],
    }
}

#[tokio::test]
async fn connect_checks_the_chain_id() {
    let url = stub(Arc::new(|_: &Value| json!("0x1"))).await;
    let ingest = IngestConfig::default();

    let client = NodeClient::connect(&chain(&url, 1), &ingest).await.unwrap();
    assert_eq!(client.chain_id(), 1);

    let err = NodeClient::connect(&chain(&url, 137), &ingest)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FeedError::Config(_)), "got {err}");
}

#[tokio::test]
async fn connect_to_unreachable_node_is_a_dial_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = NodeClient::connect(&chain(&url, 1), &IngestConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FeedError::Dial { .. }), "got {err}");
}
