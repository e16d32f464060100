//! Per-upstream process lifecycle: spawn, handshake, tool calls, shutdown.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tracing::{info, warn};

use crate::error::UpstreamError;
use crate::transport::JsonRpcTransport;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CALL_TOOL_DEADLINE: Duration = Duration::from_secs(30);

/// Immutable description of how to launch one upstream (spec.md 3).
#[derive(Clone, Debug)]
pub struct UpstreamDescriptor {
    pub name: String,
    pub command: Vec<String>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
    pub warmup_delay: Option<Duration>,
}

impl UpstreamDescriptor {
    /// Build a descriptor from a shell-like command string, naively split on
    /// spaces. This is an intentionally preserved limitation (spec.md 9): it
    /// breaks for arguments containing spaces. Use [`UpstreamDescriptor::with_argv`]
    /// to bypass it.
    pub fn from_command_string(name: impl Into<String>, command: &str) -> Self {
        let argv = command
            .split(' ')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        Self::with_argv(name, argv)
    }

    /// Build a descriptor from a pre-split argv, avoiding the naive split.
    pub fn with_argv(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: argv,
            env: Vec::new(),
            current_dir: None,
            warmup_delay: None,
        }
    }

    pub fn with_env(mut self, env: Vec<(OsString, OsString)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Spawned = 0,
    Initialized = 1,
    Ready = 2,
    Closed = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Spawned,
            1 => State::Initialized,
            2 => State::Ready,
            _ => State::Closed,
        }
    }
}

/// Owns exactly one child process and its transport (spec.md 3).
pub struct UpstreamClient {
    name: String,
    transport: Arc<JsonRpcTransport>,
    child: Mutex<Option<Child>>,
    state: AtomicU8,
}

impl UpstreamClient {
    /// Spawn the child, drive the `initialize` handshake, and wait out any
    /// configured warmup delay before returning a `Ready` client.
    pub async fn start(descriptor: UpstreamDescriptor) -> Result<Self, UpstreamError> {
        let Some((program, args)) = descriptor.command.split_first() else {
            return Err(UpstreamError::Spawn {
                command: String::new(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty command",
                ),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &descriptor.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &descriptor.env {
            command.env(key, value);
        }

        let command_debug = format!("{command:?}");
        let mut child = command.spawn().map_err(|source| UpstreamError::Spawn {
            command: command_debug,
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Handshake("child stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UpstreamError::Handshake("child stdin unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(descriptor.name.clone(), stderr));
        }

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while notify_rx.recv().await.is_some() {} });

        let transport = Arc::new(JsonRpcTransport::spawn(stdout, stdin, notify_tx));

        let client = Self {
            name: descriptor.name.clone(),
            transport,
            child: Mutex::new(Some(child)),
            state: AtomicU8::new(State::Spawned as u8),
        };

        client.handshake(descriptor.warmup_delay).await?;
        Ok(client)
    }

    /// Test-support constructor: drive the handshake over an already
    /// connected stream pair (e.g. `tokio::io::duplex`) instead of spawning
    /// a real child process. There is no child to kill on disconnect.
    pub async fn start_with_io<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        warmup_delay: Option<Duration>,
    ) -> Result<Self, UpstreamError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while notify_rx.recv().await.is_some() {} });

        let transport = Arc::new(JsonRpcTransport::spawn(reader, writer, notify_tx));
        let client = Self {
            name: name.into(),
            transport,
            child: Mutex::new(None),
            state: AtomicU8::new(State::Spawned as u8),
        };

        client.handshake(warmup_delay).await?;
        Ok(client)
    }

    async fn handshake(&self, warmup_delay: Option<Duration>) -> Result<(), UpstreamError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "mcp-aggregate-gateway", "version": env!("CARGO_PKG_VERSION") },
        });

        let (_, rx) = self.transport.request("initialize", params).await?;
        let result = time::timeout(CALL_TOOL_DEADLINE, rx)
            .await
            .map_err(|_| UpstreamError::Timeout(CALL_TOOL_DEADLINE))?
            .map_err(|_| UpstreamError::ChannelClosed)?
            .map_err(|err| UpstreamError::Handshake(err.to_string()))?;

        info!(upstream = %self.name, capabilities = ?result.get("capabilities"), "upstream initialized");
        self.state
            .store(State::Initialized as u8, Ordering::SeqCst);

        self.transport
            .notify("notifications/initialized", Value::Null)?;

        if let Some(delay) = warmup_delay {
            time::sleep(delay).await;
        }

        self.state.store(State::Ready as u8, Ordering::SeqCst);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn require_ready(&self) -> Result<(), UpstreamError> {
        match State::from_u8(self.state.load(Ordering::SeqCst)) {
            State::Ready => Ok(()),
            State::Closed => Err(UpstreamError::Closed(self.name.clone())),
            _ => Err(UpstreamError::NotReady(self.name.clone())),
        }
    }

    /// Invoke `tools/call` on the upstream, blocking until the response
    /// arrives or the 30s deadline elapses (spec.md 4.2).
    pub async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, UpstreamError> {
        self.require_ready()?;

        let params = serde_json::json!({ "name": tool, "arguments": args });
        let (_, rx) = self.transport.request("tools/call", params).await?;

        match time::timeout(CALL_TOOL_DEADLINE, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(UpstreamError::ChannelClosed),
            Err(_) => Err(UpstreamError::Timeout(CALL_TOOL_DEADLINE)),
        }
    }

    /// Issue `tools/list`; used only for optional startup verification.
    pub async fn list_tools(&self) -> Result<Value, UpstreamError> {
        self.require_ready()?;
        let (_, rx) = self.transport.request("tools/list", Value::Null).await?;
        match time::timeout(CALL_TOOL_DEADLINE, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(UpstreamError::ChannelClosed),
            Err(_) => Err(UpstreamError::Timeout(CALL_TOOL_DEADLINE)),
        }
    }

    /// Signal the child to exit, fail every pending call terminally, and
    /// transition to `Closed`. Idempotent.
    pub async fn disconnect(&self) {
        self.state.store(State::Closed as u8, Ordering::SeqCst);
        self.transport
            .close(UpstreamError::Closed(self.name.clone()))
            .await;

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = time::timeout(Duration::from_secs(5), child.wait()).await;
        }
    }

    pub fn is_ready(&self) -> bool {
        State::from_u8(self.state.load(Ordering::SeqCst)) == State::Ready
    }
}

async fn drain_stderr(name: String, stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(upstream = %name, "stderr: {line}");
    }
}
