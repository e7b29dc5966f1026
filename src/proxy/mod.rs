//! Proxy core — one client-facing socket per backend, JSON-RPC in between.
//!
//! This module handles:
//! - Framing and classifying JSON-RPC messages on every transport
//! - Access control and before/after interceptors on tool calls
//! - Correlating responses from backends back to the client that asked
//! - Supervising external backend processes (launch, monitor, restart, stop)
//! - Hosting in-process tool handlers without a subprocess
//! - The backend registry and its lifecycle, plus status reporting

pub mod access;
pub mod codec;
mod connection;
pub mod docstring;
pub mod errors;
pub mod host;
pub mod interceptor;
mod listener;
pub mod registry;
pub mod router;
pub mod status;
pub mod supervisor;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports for convenience
pub use access::AccessPolicy;
pub use codec::{FrameCodec, Framing};
pub use errors::{FrameError, ProxyError};
pub use host::{OperationDecl, ParamDecl, ToolArgs, ToolHandler, ToolHost};
pub use interceptor::{AfterHook, BeforeHook, BeforeOutcome, HookContext, InterceptorTable};
pub use registry::{ProxyContext, ProxySettings};
pub use status::{BackendStatus, ProxyStatus};
pub use types::{
    BackendId, BackendSpec, BackendState, CommandSpec, Message, Request, RequestId, Response,
    RestartPolicy, TransportKind, TransportSpec,
};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
