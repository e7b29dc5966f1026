//! Proxy error types.

use std::path::PathBuf;

use thiserror::Error;

use super::types::{error_codes, BackendState, JsonRpcError};

/// Errors surfaced by registration, lifecycle and call handling.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A backend process could not be started or died during startup.
    #[error("failed to launch backend '{backend}': {reason}")]
    LaunchError { backend: String, reason: String },

    /// The client-facing endpoint could not be created.
    #[error("failed to bind endpoint {} for backend '{backend}': {reason}", endpoint.display())]
    BindError {
        backend: String,
        endpoint: PathBuf,
        reason: String,
    },

    /// Malformed or oversized frame on some transport.
    #[error(transparent)]
    FrameError(#[from] FrameError),

    /// Both a whitelist and a blacklist were supplied.
    #[error("backend '{backend}' declares both a whitelist and a blacklist")]
    PolicyConflict { backend: String },

    /// An in-process operation's signature cannot be expressed as a tool schema.
    #[error("operation '{operation}' of backend '{backend}' cannot be exposed: {reason}")]
    SchemaError {
        backend: String,
        operation: String,
        reason: String,
    },

    /// Arguments failed validation, or the tool does not exist.
    #[error("invalid params for '{tool}': {reason}")]
    InvalidParams { tool: String, reason: String },

    /// An in-process tool returned an error or panicked.
    #[error("tool '{tool}' execution failed: {reason}")]
    ToolExecutionError { tool: String, reason: String },

    /// The backend process is gone or its transport closed.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// No response arrived before the call deadline.
    #[error("request to backend '{backend}' timed out after {timeout_ms}ms")]
    TimeoutError { backend: String, timeout_ms: u64 },

    /// A client reused a request id that is still in flight on its connection.
    #[error("request id {id} is already in flight on this connection")]
    DuplicateRequest { id: String },

    #[error("backend '{name}' is already registered")]
    DuplicateBackend { name: String },

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("backend '{backend}' cannot {action} while {state}")]
    InvalidState {
        backend: String,
        action: &'static str,
        state: BackendState,
    },

    /// Configuration error (bad config file, bad server spec).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl ProxyError {
    /// JSON-RPC error code used when this error answers a client request.
    pub fn error_code(&self) -> i64 {
        match self {
            Self::FrameError(FrameError::Malformed { .. }) => error_codes::PARSE_ERROR,
            Self::PolicyConflict { .. } => error_codes::NOT_PERMITTED,
            Self::InvalidParams { .. } => error_codes::INVALID_PARAMS,
            Self::ToolExecutionError { .. } => error_codes::TOOL_EXECUTION_ERROR,
            Self::LaunchError { .. } | Self::BackendUnavailable { .. } => {
                error_codes::BACKEND_UNAVAILABLE
            }
            Self::TimeoutError { .. } => error_codes::REQUEST_TIMEOUT,
            Self::DuplicateRequest { .. } => error_codes::INVALID_REQUEST,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.error_code(), self.to_string())
    }
}

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingLength,

    #[error("invalid Content-Length header: {value}")]
    InvalidLength { value: String },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_for_client_facing_errors() {
        let timeout = ProxyError::TimeoutError {
            backend: "files".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(timeout.error_code(), error_codes::REQUEST_TIMEOUT);
        assert!(timeout.to_string().contains("30000ms"));

        let invalid = ProxyError::InvalidParams {
            tool: "add".into(),
            reason: "missing required parameter 'b'".into(),
        };
        let rpc = invalid.to_rpc_error();
        assert_eq!(rpc.code, error_codes::INVALID_PARAMS);
        assert!(rpc.message.contains("'b'"));
    }

    #[test]
    fn test_frame_error_wraps_transparently() {
        let err = ProxyError::from(FrameError::Oversized {
            size: 10,
            limit: 5,
        });
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds the 5 byte limit");
    }
}
