//! Line-delimited JSON-RPC 2.0 framing over a generic async byte stream.
//!
//! The transport is deliberately generic over `AsyncRead`/`AsyncWrite` rather
//! than hardcoded to [`tokio::process::Child`] pipes, so the same reader and
//! writer tasks drive a real child's stdio in production and an in-memory
//! `tokio::io::duplex` pair in tests (see `tests/support.rs`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::UpstreamError;

pub type RequestId = i64;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, UpstreamError>>>>>;

/// A decoded inbound message: either a correlated response or a notification.
#[derive(Debug)]
pub enum Inbound {
    Response {
        id: RequestId,
        result: Option<Value>,
        error: Option<RpcErrorBody>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// Framed JSON-RPC transport. Owns a writer task, a reader task, and the
/// table of requests awaiting a correlated response.
pub struct JsonRpcTransport {
    writer: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicI64,
    tasks: Vec<JoinHandle<()>>,
    notifications: mpsc::UnboundedSender<(String, Option<Value>)>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl JsonRpcTransport {
    /// Spawn reader/writer tasks over an already-connected stream pair.
    ///
    /// `notify_tx` receives every inbound notification (a message without an
    /// `id`); callers that don't care about notifications can drop the
    /// receiving end immediately; sends simply become no-ops.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        notify_tx: mpsc::UnboundedSender<(String, Option<Value>)>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(writer_task(writer, writer_rx));
        let reader_handle = tokio::spawn(reader_task(
            reader,
            pending.clone(),
            notify_tx.clone(),
            closed.clone(),
        ));

        Self {
            writer: writer_tx,
            pending,
            next_id: AtomicI64::new(1),
            tasks: vec![writer_handle, reader_handle],
            notifications: notify_tx,
            closed,
        }
    }

    /// Allocate the next request id and register a pending slot for it.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(RequestId, oneshot::Receiver<Result<Value, UpstreamError>>), UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed("transport".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let serialized = serde_json::to_string(&message)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        if self.writer.send(serialized).is_err() {
            let mut guard = self.pending.lock().await;
            guard.remove(&id);
            return Err(UpstreamError::ChannelClosed);
        }

        Ok((id, rx))
    }

    /// Fire a notification (no id, no response expected).
    pub fn notify(&self, method: &str, params: Value) -> Result<(), UpstreamError> {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let serialized = serde_json::to_string(&message)?;
        self.writer
            .send(serialized)
            .map_err(|_| UpstreamError::ChannelClosed)
    }

    /// Fail every pending request terminally and mark the transport closed.
    /// Atomic with the closed flag so a late response can never resolve a
    /// caller that has already timed out or observed shutdown.
    pub async fn close(&self, reason: UpstreamError) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.pending.lock().await;
        for (_, tx) in guard.drain() {
            let _ = tx.send(Err(reason_clone(&reason)));
        }
        for handle in &self.tasks {
            handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn reason_clone(reason: &UpstreamError) -> UpstreamError {
    match reason {
        UpstreamError::ProcessExited => UpstreamError::ProcessExited,
        UpstreamError::Closed(name) => UpstreamError::Closed(name.clone()),
        _ => UpstreamError::ProcessExited,
    }
}

async fn writer_task<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        if sink.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if sink.write_all(b"\n").await.is_err() {
            break;
        }
        if sink.flush().await.is_err() {
            break;
        }
    }
    let _ = sink.shutdown().await;
}

async fn reader_task<R>(
    source: R,
    pending: PendingMap,
    notify_tx: mpsc::UnboundedSender<(String, Option<Value>)>,
    closed: Arc<std::sync::atomic::AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(source).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read transport line: {err}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse JSON-RPC line, discarding: {err}");
                continue;
            }
        };

        match decode(value) {
            Some(Inbound::Response { id, result, error }) => {
                let sender = pending.lock().await.remove(&id);
                let Some(tx) = sender else {
                    trace!(id, "response for unknown or already-resolved request id");
                    continue;
                };
                if let Some(err) = error {
                    let _ = tx.send(Err(UpstreamError::Rpc {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }));
                } else if let Some(result) = result {
                    let _ = tx.send(Ok(result));
                } else {
                    let _ = tx.send(Err(UpstreamError::Rpc {
                        code: -32603,
                        message: "response missing both result and error".into(),
                        data: None,
                    }));
                }
            }
            Some(Inbound::Notification { method, params }) => {
                debug!(method, "inbound notification");
                let _ = notify_tx.send((method, params));
            }
            None => warn!("received malformed JSON-RPC message"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(UpstreamError::ProcessExited));
    }
}

fn decode(value: Value) -> Option<Inbound> {
    let has_id = value.get("id").is_some();
    let has_method = value.get("method").is_some();

    if has_method && !has_id {
        let method = value.get("method")?.as_str()?.to_string();
        let params = value.get("params").cloned();
        return Some(Inbound::Notification { method, params });
    }

    if has_id {
        let id = parse_id(value.get("id")?)?;
        let result = value.get("result").cloned();
        let error = value.get("error").and_then(|err| {
            Some(RpcErrorBody {
                code: err.get("code")?.as_i64()?,
                message: err.get("message")?.as_str()?.to_string(),
                data: err.get("data").cloned(),
            })
        });
        return Some(Inbound::Response { id, result, error });
    }

    None
}

fn parse_id(value: &Value) -> Option<RequestId> {
    value.as_i64().or_else(|| value.as_str()?.parse().ok())
}
