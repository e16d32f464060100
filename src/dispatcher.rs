//! End-to-end operation routing: validate -> cache -> retry-call -> compact
//! -> record (spec.md 4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{error as log_error, info};

use crate::batch::run_batch;
use crate::cache::{cache_key, ResponseCache};
use crate::error::{DispatchError, ErrorCode};
use crate::metrics::{estimate_tokens, MetricsRecorder, OperationRecord};
use crate::registry::{self, Category};
use crate::retry::{with_retry, RetryPolicy};
use crate::upstream::UpstreamClient;

const MAX_RESPONSE_BYTES: usize = 50_000;
const TRUNCATED_BODY_BYTES: usize = 49_900;

#[derive(Debug, Clone, Serialize)]
pub struct BridgeError {
    pub message: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeMeta {
    #[serde(rename = "serverName", skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(rename = "operationName")]
    pub op_name: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub cached: bool,
    #[serde(rename = "tokensEstimate")]
    pub tokens_estimate: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
    pub metadata: BridgeMeta,
}

/// A single requested operation, whether top-level or inside a batch.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub category: Category,
    pub op: String,
    pub params: Value,
}

pub struct Dispatcher {
    clients: HashMap<registry::UpstreamName, Arc<UpstreamClient>>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsRecorder>,
    retry_policy: RetryPolicy,
    max_concurrent_operations: usize,
}

impl Dispatcher {
    pub fn new(
        clients: HashMap<registry::UpstreamName, Arc<UpstreamClient>>,
        cache: Arc<ResponseCache>,
        metrics: Arc<MetricsRecorder>,
        retry_policy: RetryPolicy,
        max_concurrent_operations: usize,
    ) -> Self {
        Self {
            clients,
            cache,
            metrics,
            retry_policy,
            max_concurrent_operations,
        }
    }

    /// Dispatch one operation end-to-end (spec.md 4.7 steps 2-7). Batch
    /// requests are handled separately by [`Dispatcher::dispatch_batch`];
    /// a batch-category request reaching here is rejected.
    pub async fn dispatch(&self, request: OperationRequest) -> BridgeResult {
        if request.category == Category::Batch {
            return self.error_result(
                &request,
                DispatchError::NestedBatch,
                None,
                0,
                Instant::now(),
            );
        }

        let started = Instant::now();

        let Some(mapping) = registry::resolve(request.category, &request.op) else {
            let err = DispatchError::InvalidOperation {
                category: request.category.as_str().to_string(),
                op: request.op.clone(),
            };
            return self.error_result(&request, err, None, 0, started);
        };

        let upstream_name = mapping.upstream.as_str().to_string();

        let Some(client) = self.clients.get(&mapping.upstream) else {
            let err = DispatchError::ServerUnavailable(upstream_name.clone());
            return self.error_result(&request, err, Some(upstream_name), 0, started);
        };
        if !client.is_ready() {
            let err = DispatchError::ServerUnavailable(upstream_name.clone());
            return self.error_result(&request, err, Some(upstream_name), 0, started);
        }

        let cache_key_str = cache_key(upstream_name.as_str(), mapping.tool, &request.params);

        if mapping.cacheable {
            if let Some(cached) = self.cache.get(&cache_key_str).await {
                let tokens = estimate_tokens(&cached);
                self.record_metrics(&request, Some(&upstream_name), true, true, tokens, started);
                return BridgeResult {
                    success: true,
                    data: Some(cached),
                    error: None,
                    metadata: BridgeMeta {
                        upstream: Some(upstream_name),
                        op_name: request.op.clone(),
                        duration_ms: 0,
                        cached: true,
                        tokens_estimate: tokens,
                    },
                };
            }
        }

        let tool = mapping.tool;
        let params = request.params.clone();
        let call_result = with_retry(&self.retry_policy, || {
            let client = client.clone();
            let params = params.clone();
            async move { client.call_tool(tool, params).await }
        })
        .await;

        match call_result {
            Ok(raw) => {
                let compacted = compact_tool_result(raw);
                if mapping.cacheable {
                    self.cache.set(cache_key_str, compacted.clone()).await;
                }
                let tokens = estimate_tokens(&compacted);
                self.record_metrics(&request, Some(&upstream_name), true, false, tokens, started);
                BridgeResult {
                    success: true,
                    data: Some(compacted),
                    error: None,
                    metadata: BridgeMeta {
                        upstream: Some(upstream_name),
                        op_name: request.op.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        cached: false,
                        tokens_estimate: tokens,
                    },
                }
            }
            Err(upstream_err) => {
                log_error!(upstream = %upstream_name, op = %request.op, error = %upstream_err, "operation failed");
                let dispatch_err = DispatchError::Execution(upstream_err);
                self.error_result(&request, dispatch_err, Some(upstream_name), 0, started)
            }
        }
    }

    /// Run a batch of operations with bounded concurrency; never recurses
    /// into nested batches (spec.md 9).
    pub async fn dispatch_batch(
        &self,
        requests: Vec<OperationRequest>,
    ) -> (Vec<BridgeResult>, crate::batch::BatchSummary) {
        let dispatcher = self.clone_shared();
        let started = Instant::now();

        // `dispatch` never fails the outer `Result` — every outcome, success
        // or error, is a well-formed `BridgeResult` (spec.md 7): exceptions
        // never leak across the meta-tool boundary. The batch executor's own
        // success/failure bookkeeping is therefore not meaningful here; the
        // summary below is recomputed from each `BridgeResult.success`.
        let (outcomes, _) = run_batch(requests, self.max_concurrent_operations, move |_index, request| {
            let dispatcher = dispatcher.clone();
            async move {
                let result = dispatcher.dispatch(request).await;
                Ok(serde_json::to_value(&result).expect("BridgeResult always serializes"))
            }
        })
        .await;

        let results: Vec<BridgeResult> = outcomes
            .into_iter()
            .map(|outcome| match outcome.body {
                Some(value) => serde_json::from_value(value).expect("round-trips BridgeResult"),
                None => BridgeResult {
                    success: false,
                    data: None,
                    error: Some(BridgeError {
                        message: outcome.error.unwrap_or_else(|| "unknown error".into()),
                        code: ErrorCode::InternalError.as_str(),
                        details: None,
                    }),
                    metadata: BridgeMeta {
                        upstream: None,
                        op_name: String::new(),
                        duration_ms: 0,
                        cached: false,
                        tokens_estimate: 0,
                    },
                },
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.success).count();
        let tokens_estimate = results.iter().map(|r| r.metadata.tokens_estimate).sum();
        let summary = crate::batch::BatchSummary {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            duration: started.elapsed(),
            tokens_estimate,
        };

        (results, summary)
    }

    /// Cheap clone of the pieces needed to dispatch from inside a spawned
    /// batch task; the dispatcher's own state is entirely `Arc`-backed.
    fn clone_shared(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            clients: self.clients.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            retry_policy: self.retry_policy,
            max_concurrent_operations: self.max_concurrent_operations,
        })
    }

    fn record_metrics(
        &self,
        request: &OperationRequest,
        upstream: Option<&str>,
        success: bool,
        cache_hit: bool,
        tokens: u64,
        started: Instant,
    ) {
        self.metrics.record(OperationRecord {
            category: request.category.as_str().to_string(),
            op: request.op.clone(),
            upstream: upstream.map(str::to_string),
            success,
            cache_hit,
            duration: started.elapsed(),
            estimated_tokens: tokens,
            recorded_at: Instant::now(),
        });
    }

    fn error_result(
        &self,
        request: &OperationRequest,
        err: DispatchError,
        upstream: Option<String>,
        tokens: u64,
        started: Instant,
    ) -> BridgeResult {
        let code = err.code();
        self.record_metrics(request, upstream.as_deref(), false, false, tokens, started);
        info!(op = %request.op, code = code.as_str(), "dispatch failed");
        BridgeResult {
            success: false,
            data: None,
            error: Some(BridgeError {
                message: err.to_string(),
                code: code.as_str(),
                details: None,
            }),
            metadata: BridgeMeta {
                upstream,
                op_name: request.op.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                cached: false,
                tokens_estimate: tokens,
            },
        }
    }
}

/// Apply whitespace/size compaction to an upstream `tools/call` result
/// (spec.md 6). Only `content[].text` items with `type == "text"` are
/// touched; everything else passes through unchanged.
fn compact_tool_result(mut value: Value) -> Value {
    if let Some(content) = value.get_mut("content").and_then(Value::as_array_mut) {
        for item in content.iter_mut() {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    let compacted = compact_text(text);
                    item["text"] = Value::String(compacted);
                }
            }
        }
    }

    truncate_if_oversized(value)
}

/// Collapse runs of 3+ newlines to two, runs of 2+ whitespace to one space,
/// and trim the ends (spec.md 6).
fn compact_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newline_run = 0usize;
    let mut space_run = 0usize;

    for ch in text.chars() {
        if ch == '\n' {
            newline_run += 1;
            space_run = 0;
            continue;
        }
        if newline_run > 0 {
            if newline_run >= 3 {
                out.push('\n');
                out.push('\n');
            } else {
                for _ in 0..newline_run {
                    out.push('\n');
                }
            }
            newline_run = 0;
        }

        if ch.is_whitespace() {
            space_run += 1;
            continue;
        }
        if space_run > 0 {
            if space_run >= 2 {
                out.push(' ');
            } else {
                out.push(' ');
            }
            space_run = 0;
        }
        out.push(ch);
    }

    if newline_run > 0 {
        if newline_run >= 3 {
            out.push('\n');
            out.push('\n');
        } else {
            for _ in 0..newline_run {
                out.push('\n');
            }
        }
    } else if space_run > 0 {
        out.push(' ');
    }

    out.trim().to_string()
}

fn truncate_if_oversized(value: Value) -> Value {
    let serialized = serde_json::to_string(&value).unwrap_or_default();
    if serialized.len() <= MAX_RESPONSE_BYTES {
        return value;
    }

    let original_size = serialized.len();
    let truncated_body: String = serialized.chars().take(TRUNCATED_BODY_BYTES).collect();
    let text = format!(
        "[Response truncated - original size: {original_size} bytes]\n{truncated_body}\n[... truncated]"
    );

    serde_json::json!({
        "content": [{ "type": "text", "text": text }]
    })
}
