//! Agent-facing JSON-RPC surface: `initialize`, `tools/list`, `tools/call`
//! (spec.md 4.8 / 6).

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::dispatcher::{BridgeResult, Dispatcher, OperationRequest};
use crate::registry::{self, Category};
use crate::upstream::PROTOCOL_VERSION;

const SERVER_NAME: &str = "mcp-aggregate-gateway";

/// Build the `tools/list` schema array: one tool per meta-tool category
/// plus `batch_operations` (spec.md 4.8).
pub fn tool_schemas() -> Vec<Value> {
    let mut tools: Vec<Value> = Category::meta_tool_categories()
        .into_iter()
        .map(|category| {
            let ops = registry::list_operations(category);
            json!({
                "name": category.as_str(),
                "description": format!("Perform a {} operation", category.as_str()),
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "operation": { "type": "string", "enum": ops },
                        "params": { "type": "object" }
                    },
                    "required": ["operation", "params"]
                }
            })
        })
        .collect();

    tools.push(json!({
        "name": "batch_operations",
        "description": "Run a batch of operations across meta-tools with bounded concurrency",
        "inputSchema": {
            "type": "object",
            "properties": {
                "operations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "category": { "type": "string" },
                            "operation": { "type": "string" },
                            "params": { "type": "object" }
                        },
                        "required": ["category", "operation", "params"]
                    }
                }
            },
            "required": ["operations"]
        }
    }));

    tools
}

fn category_from_str(name: &str) -> Option<Category> {
    Category::meta_tool_categories()
        .into_iter()
        .find(|c| c.as_str() == name)
}

/// Validate `{operation, params}` against the category's registry and turn
/// it into an [`OperationRequest`], or a validation error envelope
/// (spec.md 4.8).
fn parse_single_operation(category: Category, args: &Value) -> Result<OperationRequest, Value> {
    let op = args
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| validation_error("missing or non-string `operation` field"))?;

    if registry::resolve(category, op).is_none() {
        return Err(validation_error(format!(
            "unknown operation `{op}` for category `{}`",
            category.as_str()
        )));
    }

    let params = args.get("params").cloned().unwrap_or(Value::Null);
    Ok(OperationRequest {
        category,
        op: op.to_string(),
        params,
    })
}

fn validation_error(message: impl Into<String>) -> Value {
    json!({
        "success": false,
        "error": { "message": message.into(), "code": "VALIDATION_ERROR" },
        "metadata": { "operationName": "", "durationMs": 0, "cached": false, "tokensEstimate": 0 }
    })
}

/// Handle one `tools/call` invocation and produce the text-content result
/// envelope the agent sees.
async fn handle_tool_call(dispatcher: &Dispatcher, name: &str, arguments: Value) -> Value {
    if name == "batch_operations" {
        let Some(ops) = arguments.get("operations").and_then(Value::as_array) else {
            return wrap_envelope(validation_error("missing `operations` array"));
        };

        let mut requests = Vec::with_capacity(ops.len());
        for op in ops {
            let Some(category_name) = op.get("category").and_then(Value::as_str) else {
                return wrap_envelope(validation_error("batch item missing `category`"));
            };
            let Some(category) = category_from_str(category_name) else {
                return wrap_envelope(validation_error(format!(
                    "unknown category `{category_name}`"
                )));
            };
            match parse_single_operation(category, op) {
                Ok(request) => requests.push(request),
                Err(err) => return wrap_envelope(err),
            }
        }

        let (results, summary) = dispatcher.dispatch_batch(requests).await;
        return wrap_envelope(json!({
            "success": true,
            "data": {
                "results": results,
                "summary": {
                    "total": summary.total,
                    "succeeded": summary.succeeded,
                    "failed": summary.failed,
                    "durationMs": summary.duration.as_millis() as u64,
                    "tokensEstimate": summary.tokens_estimate,
                }
            },
            "metadata": {
                "operationName": "batch_operations",
                "durationMs": summary.duration.as_millis() as u64,
                "cached": false,
                "tokensEstimate": summary.tokens_estimate
            }
        }));
    }

    let Some(category) = category_from_str(name) else {
        return wrap_envelope(validation_error(format!("unknown tool `{name}`")));
    };

    let request = match parse_single_operation(category, &arguments) {
        Ok(request) => request,
        Err(err) => return wrap_envelope(err),
    };

    let result: BridgeResult = dispatcher.dispatch(request).await;
    wrap_envelope(serde_json::to_value(&result).expect("BridgeResult always serializes"))
}

fn wrap_envelope(envelope: Value) -> Value {
    let is_error = envelope
        .get("success")
        .and_then(Value::as_bool)
        .map(|success| !success)
        .unwrap_or(true);

    json!({
        "content": [{ "type": "text", "text": serde_json::to_string(&envelope).unwrap_or_default() }],
        "isError": is_error
    })
}

/// Drive the gateway's own stdin/stdout JSON-RPC loop: read one framed
/// request per line, dispatch, write one framed response per line.
pub async fn run_stdio_server<R, W>(reader: R, mut writer: W, dispatcher: Arc<Dispatcher>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read from stdin: {err}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!("discarding malformed request line: {err}");
                continue;
            }
        };

        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");

        // Notifications carry no `id` and expect no response.
        if id.is_none() && method != "initialize" {
            continue;
        }

        let response = match method {
            "initialize" => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
                }
            })),
            "tools/list" => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tool_schemas() }
            })),
            "tools/call" => {
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                let result = handle_tool_call(&dispatcher, name, arguments).await;
                Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            }
            other => {
                info!(method = other, "unsupported method");
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("method not found: {other}") }
                }))
            }
        };

        if let Some(response) = response {
            let mut serialized = serde_json::to_vec(&response).unwrap_or_default();
            serialized.push(b'\n');
            if writer.write_all(&serialized).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schemas_includes_five_categories_plus_batch() {
        let tools = tool_schemas();
        assert_eq!(tools.len(), 6);
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"code_operations"));
        assert!(names.contains(&"batch_operations"));
    }

    #[test]
    fn parse_single_operation_rejects_unknown_op() {
        let args = json!({ "operation": "doesNotExist", "params": {} });
        let result = parse_single_operation(Category::CodeOperations, &args);
        assert!(result.is_err());
    }

    #[test]
    fn parse_single_operation_accepts_known_op() {
        let args = json!({ "operation": "findSymbol", "params": { "name_path": "User" } });
        let result = parse_single_operation(Category::CodeOperations, &args).unwrap();
        assert_eq!(result.op, "findSymbol");
    }

    #[test]
    fn wrap_envelope_marks_is_error_from_success_field() {
        let ok = wrap_envelope(json!({"success": true}));
        assert_eq!(ok["isError"], false);
        let err = wrap_envelope(json!({"success": false}));
        assert_eq!(err["isError"], true);
    }
}
