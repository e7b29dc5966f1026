//! Shared types for the proxy.
//!
//! JSON-RPC 2.0 message types as they travel between clients, the proxy and
//! backends, plus the backend-facing data model (ids, states, specs).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::codec::Framing;
use super::errors::FrameError;
use super::host::ToolHandler;
use super::interceptor::{AfterHook, BeforeHook, BeforeOutcome, HookContext, InterceptorTable};

/// The only JSON-RPC version spoken on any transport.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision announced by in-process backends.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names the proxy treats specially.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC request id. Only unique per client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A call expecting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    /// Target tool of a `tools/call` request (`params.name`).
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// Arguments of a `tools/call` request (`params.arguments`).
    pub fn tool_arguments(&self) -> Option<&Value> {
        self.params.as_ref()?.get("arguments")
    }
}

/// A fire-and-forget message; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(JsonRpcError),
}

/// Answer to a [`Request`], carrying the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(JsonRpcError::new(code, message)),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    pub fn rpc_error(&self) -> Option<&JsonRpcError> {
        match &self.outcome {
            Outcome::Error(error) => Some(error),
            Outcome::Result(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

/// Any message on any transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

fn malformed(reason: &str) -> FrameError {
    FrameError::Malformed {
        reason: reason.to_string(),
    }
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// Presence of keys decides the kind, so `"result": null` is a valid
    /// success response. Unknown top-level keys are ignored.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut obj) = value else {
            return Err(malformed("message is not a JSON object"));
        };

        match obj.remove("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            _ => return Err(malformed("missing or unsupported \"jsonrpc\" version")),
        }

        let id = match obj.remove("id") {
            None => None,
            Some(raw) => Some(
                RequestId::from_value(&raw)
                    .ok_or_else(|| malformed("id must be a string or an integer"))?,
            ),
        };
        let params = obj.remove("params");
        let result = obj.remove("result");
        let error = obj.remove("error");

        match obj.remove("method") {
            Some(Value::String(method)) => {
                if result.is_some() || error.is_some() {
                    return Err(malformed("a request cannot carry result or error"));
                }
                Ok(match id {
                    Some(id) => Self::Request(Request { id, method, params }),
                    None => Self::Notification(Notification { method, params }),
                })
            }
            Some(_) => Err(malformed("method must be a string")),
            None => {
                let id = id.ok_or_else(|| malformed("response without id"))?;
                let outcome = match (result, error) {
                    (Some(result), None) => Outcome::Result(result),
                    (None, Some(error)) => Outcome::Error(
                        serde_json::from_value(error)
                            .map_err(|e| malformed(&format!("invalid error object: {e}")))?,
                    ),
                    _ => {
                        return Err(malformed(
                            "response must carry exactly one of result or error",
                        ))
                    }
                };
                Ok(Self::Response(Response { id, outcome }))
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Self::Request(request) => {
                obj.insert("id".into(), request.id.to_value());
                obj.insert("method".into(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(notification) => {
                obj.insert("method".into(), Value::String(notification.method.clone()));
                if let Some(params) = &notification.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(response) => {
                obj.insert("id".into(), response.id.to_value());
                match &response.outcome {
                    Outcome::Result(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Outcome::Error(error) => {
                        obj.insert(
                            "error".into(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Value::Object(obj)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// JSON-RPC error codes used by the proxy.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// An in-process tool returned an error or panicked.
    pub const TOOL_EXECUTION_ERROR: i64 = -32000;
    /// Denied by access control or blocked by an interceptor.
    pub const NOT_PERMITTED: i64 = -32001;
    /// The backend process is gone or its transport closed.
    pub const BACKEND_UNAVAILABLE: i64 = -32002;
    /// No response arrived before the call deadline.
    pub const REQUEST_TIMEOUT: i64 = -32003;
}

// ─── Identity ────────────────────────────────────────────────────────────────

/// Handle returned by `ProxyContext::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BackendId(pub(crate) u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// One accepted client socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// ─── Lifecycle State ─────────────────────────────────────────────────────────

/// Backend lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Registered,
    Starting,
    Running,
    /// The process died; the endpoint stays up and answers with errors.
    Degraded,
    Stopped,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Observable state of one backend, shared by the registry and its supervisor.
#[derive(Debug, Clone)]
pub struct StateCell {
    backend: Arc<str>,
    tx: Arc<watch::Sender<(BackendState, DateTime<Utc>)>>,
}

impl StateCell {
    pub fn new(backend: &str) -> Self {
        let (tx, _rx) = watch::channel((BackendState::Registered, Utc::now()));
        Self {
            backend: Arc::from(backend),
            tx: Arc::new(tx),
        }
    }

    pub fn get(&self) -> BackendState {
        self.tx.borrow().0
    }

    /// When the current state was entered.
    pub fn since(&self) -> DateTime<Utc> {
        self.tx.borrow().1
    }

    pub fn set(&self, state: BackendState) {
        let previous = self.tx.send_replace((state, Utc::now())).0;
        if previous != state {
            tracing::info!(
                backend = %self.backend,
                from = %previous,
                to = %state,
                "backend state changed"
            );
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<(BackendState, DateTime<Utc>)> {
        self.tx.subscribe()
    }
}

// ─── Backend Specs ───────────────────────────────────────────────────────────

/// Which kind of upstream a backend has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    External,
    InProcess,
}

/// Relaunch behaviour after an unexpected process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    /// Backoff before the given (1-based) attempt: `base * 2^(n-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// How to launch an external backend.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Pass the proxy's whole environment through instead of a minimal one.
    pub inherit_env: bool,
    pub framing: Framing,
    pub restart: Option<RestartPolicy>,
}

impl CommandSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: false,
            framing: Framing::ContentLength,
            restart: None,
        }
    }
}

/// Upstream of a backend.
#[derive(Clone)]
pub enum TransportSpec {
    External(CommandSpec),
    InProcess(Arc<dyn ToolHandler>),
}

impl TransportSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::External(_) => TransportKind::External,
            Self::InProcess(_) => TransportKind::InProcess,
        }
    }
}

impl fmt::Debug for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External(command) => f.debug_tuple("External").field(command).finish(),
            Self::InProcess(handler) => f.debug_tuple("InProcess").field(&handler.name()).finish(),
        }
    }
}

/// Everything needed to register one backend.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub name: String,
    pub transport: TransportSpec,
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
    pub interceptors: InterceptorTable,
    pub auto_start: bool,
    /// Overrides the proxy-wide call timeout.
    pub call_timeout: Option<Duration>,
}

impl BackendSpec {
    pub fn external(name: &str, command: CommandSpec) -> Self {
        Self::with_transport(name, TransportSpec::External(command))
    }

    /// The backend takes the handler's own name.
    pub fn in_process(handler: Arc<dyn ToolHandler>) -> Self {
        let name = handler.name().to_string();
        Self::with_transport(&name, TransportSpec::InProcess(handler))
    }

    fn with_transport(name: &str, transport: TransportSpec) -> Self {
        Self {
            name: name.to_string(),
            transport,
            whitelist: None,
            blacklist: None,
            interceptors: InterceptorTable::default(),
            auto_start: true,
            call_timeout: None,
        }
    }

    pub fn whitelist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn blacklist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Register a before-hook for `tool` (or `*`).
    pub fn before<F>(mut self, tool: &str, hook: F) -> Self
    where
        F: Fn(&HookContext<'_>, Request) -> anyhow::Result<BeforeOutcome> + Send + Sync + 'static,
    {
        self.interceptors.before(tool, hook);
        self
    }

    /// Register an after-hook for `tool` (or `*`).
    pub fn after<F>(mut self, tool: &str, hook: F) -> Self
    where
        F: Fn(&HookContext<'_>, &Request, Response) -> anyhow::Result<Response>
            + Send
            + Sync
            + 'static,
    {
        self.interceptors.after(tool, hook);
        self
    }

    pub fn before_hook(mut self, tool: &str, hook: Arc<dyn BeforeHook>) -> Self {
        self.interceptors.set_before(tool, hook);
        self
    }

    pub fn after_hook(mut self, tool: &str, hook: Arc<dyn AfterHook>) -> Self {
        self.interceptors.set_after(tool, hook);
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_classification() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 1}}
        }))
        .unwrap();
        let Message::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.id, RequestId::Number(7));
        assert_eq!(req.tool_name(), Some("add"));
        assert_eq!(req.tool_arguments(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn test_null_result_is_success() {
        let msg = Message::from_value(json!({"jsonrpc": "2.0", "id": "a", "result": null}))
            .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::String("a".into()));
        assert_eq!(resp.result(), Some(&Value::Null));
    }

    #[test]
    fn test_error_response_parsed() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(
            resp.rpc_error().map(|e| e.code),
            Some(error_codes::METHOD_NOT_FOUND)
        );
    }

    #[test]
    fn test_rejects_wrong_version_and_ambiguous_response() {
        assert!(Message::from_value(json!({"jsonrpc": "1.0", "id": 1, "method": "x"})).is_err());
        assert!(Message::from_value(json!({"id": 1, "method": "x"})).is_err());
        assert!(Message::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "m"}
        }))
        .is_err());
        assert!(Message::from_value(json!({"jsonrpc": "2.0", "id": 1})).is_err());
        assert!(Message::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_error_serialization_omits_missing_data() {
        let msg = Message::Response(Response::error(
            RequestId::Number(3),
            error_codes::NOT_PERMITTED,
            "method not permitted",
        ));
        let value = msg.to_value();
        assert_eq!(value["error"]["code"], json!(-32001));
        assert!(value["error"].get("data").is_none());
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_restart_backoff_is_capped() {
        let policy = RestartPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_state_cell_tracks_transitions() {
        let cell = StateCell::new("demo");
        assert_eq!(cell.get(), BackendState::Registered);
        let mut rx = cell.subscribe();
        cell.set(BackendState::Running);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().0, BackendState::Running);
        assert_eq!(cell.get(), BackendState::Running);
    }
}
