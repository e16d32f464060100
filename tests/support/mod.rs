//! In-process fake upstream: an async task that speaks the gateway's own
//! framed JSON-RPC protocol over one half of a `tokio::io::duplex` pair,
//! so integration tests never spawn a real child process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mcp_aggregate_gateway::upstream::UpstreamClient;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub struct FakeUpstream {
    pub client: Arc<UpstreamClient>,
    pub call_count: Arc<AtomicUsize>,
}

/// Spawn a fake upstream driven by `handler(tool, args) -> Ok(result) |
/// Err(message)`. Every `tools/call` increments `call_count` before the
/// handler runs.
pub async fn spawn_fake_upstream<F>(name: &str, mut handler: F) -> FakeUpstream
where
    F: FnMut(&str, &Value) -> Result<Value, String> + Send + 'static,
{
    let (gateway_side, fake_side) = tokio::io::duplex(65_536);
    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_task = call_count.clone();

    let (read_half, write_half) = tokio::io::split(fake_side);
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        let mut writer = write_half;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let msg: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(_) => continue,
            };

            let id = msg.get("id").cloned();
            let method = msg.get("method").and_then(Value::as_str).unwrap_or("");

            let response = match method {
                "initialize" => Some(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "capabilities": {} }
                })),
                "tools/call" => {
                    call_count_task.fetch_add(1, Ordering::SeqCst);
                    let params = msg.get("params").cloned().unwrap_or(Value::Null);
                    let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
                    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                    match handler(tool, &args) {
                        Ok(result) => Some(serde_json::json!({
                            "jsonrpc": "2.0", "id": id, "result": result
                        })),
                        Err(message) => Some(serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32000, "message": message }
                        })),
                    }
                }
                _ => None,
            };

            if let Some(response) = response {
                let mut bytes = serde_json::to_vec(&response).unwrap();
                bytes.push(b'\n');
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        }
    });

    let (gw_read, gw_write) = tokio::io::split(gateway_side);
    let client = UpstreamClient::start_with_io(name, gw_read, gw_write, None)
        .await
        .expect("fake upstream handshake");

    FakeUpstream {
        client: Arc::new(client),
        call_count,
    }
}
