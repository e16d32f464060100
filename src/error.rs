use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors raised by the framed JSON-RPC transport and the upstream client
/// that sits on top of it.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server did not respond to initialize: {0}")]
    Handshake(String),
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
    #[error("upstream process exited")]
    ProcessExited,
    #[error("server returned JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("upstream `{0}` is not ready")]
    NotReady(String),
    #[error("upstream `{0}` is closed")]
    Closed(String),
}

impl UpstreamError {
    /// Lowercased message used by the retry classifier (spec.md 4.5).
    pub fn classifier_message(&self) -> String {
        match self {
            UpstreamError::Rpc { message, .. } => message.to_lowercase(),
            other => other.to_string().to_lowercase(),
        }
    }

    /// Process death and closed-transport failures are never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpstreamError::ProcessExited | UpstreamError::Closed(_) | UpstreamError::ChannelClosed
        )
    }
}

/// Errors surfaced while resolving or dispatching an operation.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown operation `{category}.{op}`")]
    InvalidOperation { category: String, op: String },
    #[error("no upstream is registered for category `{0}`")]
    MappingError(String),
    #[error("upstream `{0}` is unavailable")]
    ServerUnavailable(String),
    #[error("upstream call failed: {0}")]
    Execution(#[from] UpstreamError),
    #[error("batch operations may not themselves be a batch")]
    NestedBatch,
    #[error("{0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable, agent-visible error code (spec.md 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidOperation,
    MappingError,
    ServerUnavailable,
    ExecutionError,
    TimeoutError,
    ValidationError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::MappingError => "MAPPING_ERROR",
            ErrorCode::ServerUnavailable => "SERVER_UNAVAILABLE",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::InvalidOperation { .. } => ErrorCode::InvalidOperation,
            DispatchError::MappingError(_) => ErrorCode::MappingError,
            DispatchError::ServerUnavailable(_) => ErrorCode::ServerUnavailable,
            DispatchError::Execution(err) if matches!(err, UpstreamError::Timeout(_)) => {
                ErrorCode::TimeoutError
            }
            DispatchError::Execution(_) => ErrorCode::ExecutionError,
            DispatchError::NestedBatch => ErrorCode::ValidationError,
            DispatchError::Validation(_) => ErrorCode::ValidationError,
            DispatchError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Errors surfaced while parsing gateway configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for `{key}`: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("missing required environment variable `{0}`")]
    MissingRequired(&'static str),
    #[error("`{0}_COMMAND` must not be empty")]
    EmptyCommand(&'static str),
}
