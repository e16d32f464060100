//! End-to-end scenarios against the full `tools/list` / `tools/call`
//! surface, exercised over an in-process duplex pair standing in for the
//! agent's stdio (spec.md 8).

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcp_aggregate_gateway::cache::ResponseCache;
use mcp_aggregate_gateway::dispatcher::Dispatcher;
use mcp_aggregate_gateway::metrics::MetricsRecorder;
use mcp_aggregate_gateway::registry::UpstreamName;
use mcp_aggregate_gateway::retry::RetryPolicy;
use mcp_aggregate_gateway::server::run_stdio_server;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Agent {
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

impl Agent {
    async fn call(&mut self, id: i64, method: &str, params: Value) -> Value {
        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let mut bytes = serde_json::to_vec(&request).unwrap();
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await.unwrap();
        self.writer.flush().await.unwrap();

        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

fn start_gateway(dispatcher: Arc<Dispatcher>) -> Agent {
    let (agent_side, gateway_side) = tokio::io::duplex(65_536);
    let (gw_read, gw_write) = tokio::io::split(gateway_side);
    tokio::spawn(run_stdio_server(gw_read, gw_write, dispatcher));

    let (agent_read, agent_write) = tokio::io::split(agent_side);
    Agent {
        reader: BufReader::new(agent_read),
        writer: agent_write,
    }
}

fn tool_call_envelope(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

async fn dispatcher_with_serena_handler<F>(handler: F) -> (Arc<Dispatcher>, support::FakeUpstream)
where
    F: FnMut(&str, &Value) -> Result<Value, String> + Send + 'static,
{
    let fake = support::spawn_fake_upstream("serena", handler).await;

    let mut clients = HashMap::new();
    clients.insert(UpstreamName::Serena, fake.client.clone());

    let cache = Arc::new(ResponseCache::new(Duration::from_secs(5), 100, true));
    let metrics = Arc::new(MetricsRecorder::new(true));
    let retry = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));

    let dispatcher = Arc::new(Dispatcher::new(clients, cache, metrics, retry, 10));
    (dispatcher, fake)
}

#[tokio::test]
async fn scenario_1_unknown_meta_tool_is_a_validation_error() {
    let (dispatcher, _fake) = dispatcher_with_serena_handler(|_, _| {
        Ok(json!({ "content": [{ "type": "text", "text": "unused" }] }))
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let response = agent
        .call(1, "tools/call", json!({ "name": "nope", "arguments": {} }))
        .await;

    assert_eq!(response["result"]["isError"], true);
    let envelope = tool_call_envelope(&response);
    assert_eq!(envelope["error"]["code"], "VALIDATION_ERROR");
    let message = envelope["error"]["message"].as_str().unwrap();
    assert!(message.to_lowercase().contains("unknown"));
}

#[tokio::test]
async fn scenario_2_valid_routed_call_uncached() {
    let (dispatcher, fake) = dispatcher_with_serena_handler(|tool, _args| {
        assert_eq!(tool, "find_symbol");
        Ok(json!({ "content": [{ "type": "text", "text": "ok" }] }))
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let response = agent
        .call(
            1,
            "tools/call",
            json!({
                "name": "code_operations",
                "arguments": { "operation": "findSymbol", "params": { "name_path": "User" } }
            }),
        )
        .await;

    let envelope = tool_call_envelope(&response);
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["metadata"]["serverName"], "serena");
    assert_eq!(envelope["metadata"]["cached"], false);
    assert!(envelope["metadata"]["tokensEstimate"].as_u64().unwrap() > 0);
    assert_eq!(fake.call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_3_cache_hit_on_replay() {
    let (dispatcher, fake) = dispatcher_with_serena_handler(|_, _| {
        Ok(json!({ "content": [{ "type": "text", "text": "ok" }] }))
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let args = json!({
        "name": "code_operations",
        "arguments": { "operation": "findSymbol", "params": { "name_path": "User" } }
    });

    let first = tool_call_envelope(&agent.call(1, "tools/call", args.clone()).await);
    assert_eq!(first["metadata"]["cached"], false);

    let second = tool_call_envelope(&agent.call(2, "tools/call", args).await);
    assert_eq!(second["metadata"]["cached"], true);
    assert_eq!(second["metadata"]["durationMs"], 0);
    assert_eq!(fake.call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_4_cache_key_canonicalization() {
    let (dispatcher, fake) = dispatcher_with_serena_handler(|_, _| {
        Ok(json!({ "content": [{ "type": "text", "text": "ok" }] }))
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let first = tool_call_envelope(
        &agent
            .call(
                1,
                "tools/call",
                json!({
                    "name": "code_operations",
                    "arguments": { "operation": "findSymbol", "params": { "a": 1, "b": 2 } }
                }),
            )
            .await,
    );
    assert_eq!(first["metadata"]["cached"], false);

    let second = tool_call_envelope(
        &agent
            .call(
                2,
                "tools/call",
                json!({
                    "name": "code_operations",
                    "arguments": { "operation": "findSymbol", "params": { "b": 2, "a": 1 } }
                }),
            )
            .await,
    );
    assert_eq!(second["metadata"]["cached"], true);
    assert_eq!(fake.call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_5_batch_with_mixed_outcomes() {
    let (dispatcher, _fake) = dispatcher_with_serena_handler(|tool, args| {
        if tool == "find_symbol" && args.get("name_path").and_then(Value::as_str) == Some("Bad") {
            Err("network timeout talking to upstream".to_string())
        } else {
            Ok(json!({ "content": [{ "type": "text", "text": "ok" }] }))
        }
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let batch = json!({
        "name": "batch_operations",
        "arguments": {
            "operations": [
                { "category": "code_operations", "operation": "findSymbol", "params": { "name_path": "A" } },
                { "category": "code_operations", "operation": "findSymbol", "params": { "name_path": "Bad" } },
                { "category": "code_operations", "operation": "findSymbol", "params": { "name_path": "C" } },
            ]
        }
    });

    let response = agent.call(1, "tools/call", batch).await;
    let envelope = tool_call_envelope(&response);

    let results = envelope["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[1]["success"], false);
    assert_eq!(results[1]["error"]["code"], "EXECUTION_ERROR");
    assert_eq!(results[2]["success"], true);

    assert_eq!(envelope["data"]["summary"]["succeeded"], 2);
    assert_eq!(envelope["data"]["summary"]["failed"], 1);
    assert!(envelope["data"]["summary"]["tokensEstimate"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn batch_operations_reject_nested_batch_category() {
    let (dispatcher, _fake) = dispatcher_with_serena_handler(|_, _| {
        Ok(json!({ "content": [{ "type": "text", "text": "ok" }] }))
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let response = agent
        .call(
            1,
            "tools/call",
            json!({
                "name": "batch_operations",
                "arguments": {
                    "operations": [
                        { "category": "batch", "operation": "whatever", "params": {} }
                    ]
                }
            }),
        )
        .await;

    let envelope = tool_call_envelope(&response);
    assert_eq!(envelope["success"], false);
}

#[tokio::test]
async fn initialize_and_tools_list_round_trip() {
    let (dispatcher, _fake) = dispatcher_with_serena_handler(|_, _| {
        Ok(json!({ "content": [] }))
    })
    .await;
    let mut agent = start_gateway(dispatcher);

    let init = agent.call(1, "initialize", json!({})).await;
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");

    let list = agent.call(2, "tools/list", json!({})).await;
    let tools = list["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 6);
}
