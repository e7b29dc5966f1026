//! Shared fixtures for proxy tests.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use super::codec::{FrameCodec, Framing};
use super::host::{OperationDecl, ToolArgs, ToolHandler};
use super::types::{CommandSpec, Message, Notification, Request, RequestId, Response};

/// `sh -c <script>` speaking line-delimited JSON.
pub(crate) fn shell_backend(script: &str) -> CommandSpec {
    let mut spec = CommandSpec::new("sh");
    spec.args = vec!["-c".into(), script.into()];
    spec.framing = Framing::Line;
    spec
}

/// Answers every request with the request object itself as the result.
pub(crate) fn echo_backend() -> CommandSpec {
    shell_backend(
        r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$id" "$line"
  fi
done"#,
    )
}

/// Writes everything it receives on stdin to `path` and never answers.
pub(crate) fn recording_backend(path: &Path) -> CommandSpec {
    shell_backend(&format!("cat > '{}'", path.display()))
}

/// In-process handler with a couple of arithmetic tools.
pub(crate) struct Calculator;

impl ToolHandler for Calculator {
    fn name(&self) -> &str {
        "calc"
    }

    fn describe(&self) -> Vec<OperationDecl> {
        vec![
            OperationDecl::new("add")
                .param("a", "int")
                .param("b", "int")
                .doc("Add two numbers."),
            OperationDecl::new("echo")
                .param("value", "str")
                .doc("Return the value unchanged."),
            OperationDecl::new("sleep")
                .param("ms", "int")
                .doc("Sleep for a while."),
        ]
    }

    fn invoke(&self, operation: &str, args: ToolArgs) -> anyhow::Result<Value> {
        match operation {
            "add" => Ok(json!(args.get::<i64>("a")? + args.get::<i64>("b")?)),
            "echo" => Ok(json!(args.get::<String>("value")?)),
            "sleep" => {
                let ms: u64 = args.get("ms")?;
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!("done"))
            }
            other => anyhow::bail!("unknown operation {other}"),
        }
    }
}

/// Minimal protocol client over a backend's socket.
pub(crate) struct TestClient {
    framed: Framed<UnixStream, FrameCodec>,
}

impl TestClient {
    pub(crate) async fn connect(path: &Path, framing: Framing) -> Self {
        let stream = UnixStream::connect(path).await.expect("connect to endpoint");
        Self {
            framed: Framed::new(stream, FrameCodec::new(framing)),
        }
    }

    pub(crate) async fn send(&mut self, message: Message) {
        self.framed.send(message).await.expect("send frame");
    }

    pub(crate) async fn request(&mut self, id: i64, method: &str, params: Option<Value>) {
        self.send(Message::Request(Request::new(id, method, params)))
            .await;
    }

    pub(crate) async fn notify(&mut self, method: &str, params: Option<Value>) {
        self.send(Message::Notification(Notification::new(method, params)))
            .await;
    }

    pub(crate) async fn recv(&mut self) -> Response {
        let frame = tokio::time::timeout(Duration::from_secs(10), self.framed.next())
            .await
            .expect("response within timeout")
            .expect("connection open")
            .expect("valid frame");
        match frame {
            Message::Response(response) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    pub(crate) async fn call(&mut self, id: i64, method: &str, params: Option<Value>) -> Response {
        self.request(id, method, params).await;
        let response = self.recv().await;
        assert_eq!(response.id, RequestId::Number(id));
        response
    }

    pub(crate) async fn call_tool(&mut self, id: i64, tool: &str, arguments: Value) -> Response {
        self.call(
            id,
            "tools/call",
            Some(json!({"name": tool, "arguments": arguments})),
        )
        .await
    }

    /// True when the peer closes without sending anything within `wait`.
    pub(crate) async fn closed_within(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.framed.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }
}
