//! Client connection handling.
//!
//! Every accepted socket gets its own task. Frames are decoded in order and
//! each request is handled on its own sub-task, so a client may pipeline
//! calls; answers go back through a single writer task in completion order.
//!
//! For `tools/call` the pipeline is: access check, before-hooks, forward,
//! await the correlated response, after-hooks, reply. `tools/list` results
//! are filtered by the same access policy. Everything else is forwarded
//! unchanged.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::access::AccessPolicy;
use super::codec::{FrameCodec, Framing};
use super::errors::ProxyError;
use super::host::ToolHost;
use super::interceptor::{BeforeOutcome, HookContext, InterceptorTable};
use super::router::Router;
use super::supervisor::ProcessSupervisor;
use super::types::{
    error_codes, methods, BackendId, ConnectionId, Message, Notification, Outcome, Request,
    RequestId, Response,
};

/// Replies queued per connection before call tasks wait on the writer.
const REPLY_QUEUE: usize = 64;

// ─── Upstream ────────────────────────────────────────────────────────────────

/// Where a backend's traffic goes.
#[derive(Clone)]
pub(crate) enum Upstream {
    Process(Arc<ProcessSupervisor>),
    InProcess(Arc<ToolHost>),
}

impl Upstream {
    /// Send a request registered with `router`. The response always comes
    /// back through `router.complete`.
    async fn forward(&self, router: &Arc<Router>, request: Request) -> Result<(), ProxyError> {
        match self {
            Self::Process(supervisor) => supervisor.send(Message::Request(request)).await,
            Self::InProcess(host) => {
                let host = Arc::clone(host);
                let router = Arc::clone(router);
                // Handlers are synchronous and may block.
                tokio::task::spawn_blocking(move || {
                    let response = host.handle(&request);
                    router.complete(response);
                });
                Ok(())
            }
        }
    }

    async fn notify(&self, notification: Notification) -> Result<(), ProxyError> {
        match self {
            Self::Process(supervisor) => supervisor.send(Message::Notification(notification)).await,
            Self::InProcess(_) => Ok(()),
        }
    }
}

// ─── BackendContext ──────────────────────────────────────────────────────────

/// Everything a connection needs to know about its backend.
pub(crate) struct BackendContext {
    pub id: BackendId,
    pub name: String,
    pub policy: AccessPolicy,
    pub interceptors: InterceptorTable,
    pub router: Arc<Router>,
    pub upstream: Upstream,
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl BackendContext {
    async fn handle_request(&self, connection: ConnectionId, request: Request) -> Response {
        match request.method.as_str() {
            methods::TOOLS_CALL => self.handle_tool_call(connection, request).await,
            methods::TOOLS_LIST => {
                let mut response = self.forward(connection, request, None).await;
                if let Outcome::Result(result) = &mut response.outcome {
                    let hidden = self.policy.filter_tool_list(result);
                    if hidden > 0 {
                        tracing::debug!(backend = %self.name, hidden, "filtered tools/list result");
                    }
                }
                response
            }
            _ => self.forward(connection, request, None).await,
        }
    }

    async fn handle_tool_call(&self, connection: ConnectionId, request: Request) -> Response {
        let client_id = request.id.clone();
        let Some(tool) = request.tool_name().map(str::to_owned) else {
            return missing_tool_name(client_id);
        };
        if !self.policy.permits(&tool) {
            return self.denied(client_id, &tool);
        }

        let ctx = HookContext {
            backend: &self.name,
            tool: &tool,
        };
        let request = match self.interceptors.run_before(&ctx, request) {
            BeforeOutcome::Continue(mut request) => {
                // Hooks may rewrite the payload, never the correlation id.
                request.id = client_id.clone();
                request
            }
            BeforeOutcome::Block { reason } => {
                return Response::error(
                    client_id,
                    error_codes::NOT_PERMITTED,
                    format!("tool call blocked: {reason}"),
                );
            }
        };

        // The policy applies to what is sent, including a renamed tool.
        let Some(tool) = request.tool_name().map(str::to_owned) else {
            return missing_tool_name(client_id);
        };
        if !self.policy.permits(&tool) {
            return self.denied(client_id, &tool);
        }
        let ctx = HookContext {
            backend: &self.name,
            tool: &tool,
        };

        let response = self
            .forward(connection, request.clone(), Some(tool.clone()))
            .await;
        let mut response = self.interceptors.run_after(&ctx, &request, response);
        response.id = client_id;
        response
    }

    fn denied(&self, client_id: RequestId, tool: &str) -> Response {
        tracing::warn!(backend = %self.name, tool, "tool call denied by access policy");
        Response::error(
            client_id,
            error_codes::NOT_PERMITTED,
            format!("method not permitted: '{tool}' is not available on '{}'", self.name),
        )
    }

    async fn forward(&self, connection: ConnectionId, request: Request, tool: Option<String>) -> Response {
        let client_id = request.id.clone();
        let (pending, upstream_request) =
            match self.router.begin(connection, request, tool, self.call_timeout) {
                Ok(registered) => registered,
                Err(e) => return Response::error(client_id, e.error_code(), e.to_string()),
            };

        if let Err(e) = self.upstream.forward(&self.router, upstream_request).await {
            self.router.abandon(pending.upstream_id());
            tracing::warn!(backend = %self.name, error = %e, "could not forward request");
            return Response::error(client_id, e.error_code(), e.to_string());
        }
        self.router.wait(pending).await
    }

    async fn handle_notification(&self, notification: Notification) {
        if notification.method == methods::TOOLS_CALL {
            // Would reach the tool without access control and never be answered.
            tracing::warn!(backend = %self.name, "dropping tools/call sent as a notification");
            return;
        }
        if let Err(e) = self.upstream.notify(notification).await {
            tracing::debug!(backend = %self.name, error = %e, "notification not delivered");
        }
    }
}

fn missing_tool_name(client_id: RequestId) -> Response {
    Response::error(
        client_id,
        error_codes::INVALID_PARAMS,
        "tools/call requires params.name",
    )
}

// ─── Connection Task ─────────────────────────────────────────────────────────

/// Why a connection stopped reading frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// Listener drain: finish in-flight calls, then flush.
    Drain,
    /// The client shut down its write side. It may still be reading.
    ReadClosed,
    /// Unreadable frame or forced shutdown.
    Abort,
}

/// Serve one client until it disconnects, sends an unreadable frame, or the
/// listener shuts down.
///
/// `drain` stops reading new frames and lets in-flight calls finish;
/// `force` drops them. After a client half-closes, its in-flight calls get
/// up to the call timeout to answer unless the reply writer finds the
/// client gone first.
pub(crate) async fn serve_connection(
    ctx: Arc<BackendContext>,
    stream: UnixStream,
    drain: CancellationToken,
    force: CancellationToken,
) {
    let connection = ConnectionId::new();
    let (read_half, write_half) = stream.into_split();
    let codec = FrameCodec::new(Framing::Auto).with_max_frame_bytes(ctx.max_frame_bytes);
    let mut frames = FramedRead::new(read_half, codec.clone());
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);
    let mut writer = tokio::spawn(write_replies(FramedWrite::new(write_half, codec), reply_rx));
    let mut calls: JoinSet<()> = JoinSet::new();

    tracing::info!(backend = %ctx.name, connection = %connection, "client connected");

    let ending = loop {
        tokio::select! {
            _ = force.cancelled() => break Ending::Abort,
            _ = drain.cancelled() => break Ending::Drain,
            frame = frames.next() => match frame {
                Some(Ok(message)) => dispatch(&ctx, connection, message, &reply_tx, &mut calls).await,
                Some(Err(e)) => {
                    tracing::warn!(
                        backend = %ctx.name,
                        connection = %connection,
                        error = %e,
                        "unreadable frame, closing connection"
                    );
                    break Ending::Abort;
                }
                None => break Ending::ReadClosed,
            },
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(backend = %ctx.name, connection = %connection, "call task panicked");
                    }
                }
            }
        }
    };

    let mut writer_done = false;
    if ending != Ending::Abort && !calls.is_empty() {
        tracing::debug!(
            backend = %ctx.name,
            connection = %connection,
            in_flight = calls.len(),
            ending = ?ending,
            "finishing in-flight calls"
        );
        // Drain is bounded by the listener's force token; a half-closed
        // client by the call timeout.
        let limit = tokio::time::sleep(ctx.call_timeout);
        tokio::pin!(limit);
        loop {
            tokio::select! {
                _ = force.cancelled() => break,
                _ = &mut limit, if ending == Ending::ReadClosed => break,
                _ = &mut writer, if ending == Ending::ReadClosed => {
                    writer_done = true;
                    break;
                }
                joined = calls.join_next() => if joined.is_none() { break },
            }
        }
    }

    calls.shutdown().await;
    ctx.router.fail_connection(connection);
    drop(reply_tx);
    if !writer_done {
        let flush = ending != Ending::Abort && !force.is_cancelled();
        if !flush || tokio::time::timeout(ctx.call_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
    }
    tracing::info!(backend = %ctx.name, connection = %connection, "client disconnected");
}

async fn dispatch(
    ctx: &Arc<BackendContext>,
    connection: ConnectionId,
    message: Message,
    replies: &mpsc::Sender<Message>,
    calls: &mut JoinSet<()>,
) {
    match message {
        Message::Request(request) => {
            log_request(&ctx.name, &request);
            let ctx = Arc::clone(ctx);
            let replies = replies.clone();
            calls.spawn(async move {
                let response = ctx.handle_request(connection, request).await;
                let _ = replies.send(Message::Response(response)).await;
            });
        }
        Message::Notification(notification) => ctx.handle_notification(notification).await,
        Message::Response(response) => {
            tracing::debug!(backend = %ctx.name, id = %response.id, "ignoring response sent by client");
        }
    }
}

async fn write_replies(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut replies: mpsc::Receiver<Message>,
) {
    while let Some(message) = replies.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "client went away before its reply was written");
            break;
        }
    }
}

/// Log a request without its argument values.
fn log_request(backend: &str, request: &Request) {
    match request.tool_name() {
        Some(tool) => {
            let argument_keys: Vec<&str> = request
                .tool_arguments()
                .and_then(|args| args.as_object())
                .map(|args| args.keys().map(String::as_str).collect())
                .unwrap_or_default();
            tracing::debug!(
                backend,
                id = %request.id,
                method = %request.method,
                tool,
                argument_keys = ?argument_keys,
                "request received"
            );
        }
        None => {
            tracing::debug!(backend, id = %request.id, method = %request.method, "request received");
        }
    }
}
