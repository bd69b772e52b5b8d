//! Local-process transport: spawns the server and exchanges line-delimited
//! JSON-RPC 2.0 over its stdin/stdout.

use super::rpc::{self, PendingRequests, RpcChannel};
use super::Transport;
use crate::descriptor::TransportKind;
use crate::protocol::*;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use tracing::{debug, error, warn};

/// Longest stdout line accepted from a server before the session is dropped.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

struct ProcessSession {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    reader: JoinHandle<()>,
}

/// MCP client for a server running as a child process.
///
/// Not multiplexed: the connection manager serializes calls through it.
pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    request_timeout: Duration,
    max_line_bytes: usize,
    pending: Arc<PendingRequests>,
    /// Cleared by the reader task when stdout closes.
    alive: Arc<AtomicBool>,
    ready: AtomicBool,
    session: Mutex<Option<Arc<ProcessSession>>>,
}

impl StdioTransport {
    /// A disconnected client; call [`Transport::connect`] to open it.
    pub fn new(
        server_id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            command: command.into(),
            args,
            env,
            request_timeout,
            max_line_bytes: MAX_LINE_BYTES,
            pending: PendingRequests::new(),
            alive: Arc::new(AtomicBool::new(false)),
            ready: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    /// Override the stdout line limit.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    fn spawn(&self) -> ToolmeshResult<ProcessSession> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ToolmeshError::Connection(format!(
                "Failed to spawn MCP server '{}' ({}): {e}",
                self.server_id, self.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolmeshError::Connection("MCP server stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolmeshError::Connection("MCP server stdout not available".into()))?;

        self.alive.store(true, Ordering::SeqCst);
        let pending = Arc::clone(&self.pending);
        let alive = Arc::clone(&self.alive);
        let server_id = self.server_id.clone();
        let max_line_bytes = self.max_line_bytes;
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(max_line_bytes));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        error!(server = %server_id, limit = max_line_bytes, "MCP server wrote an oversized line");
                        break;
                    }
                    Err(LinesCodecError::Io(e)) => {
                        error!(server = %server_id, error = %e, "Error reading MCP server stdout");
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(msg) if msg.method.is_some() => {
                        debug!(server = %server_id, method = ?msg.method, "Ignoring server-initiated message");
                    }
                    Ok(resp) => {
                        pending.resolve(resp);
                    }
                    Err(e) => {
                        debug!(server = %server_id, line = %trimmed, error = %e, "Non-JSON-RPC line from MCP server");
                    }
                }
            }
            debug!(server = %server_id, "MCP server stdout closed");
            alive.store(false, Ordering::SeqCst);
            pending.fail_all();
        });

        Ok(ProcessSession {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            reader,
        })
    }

    async fn current(&self) -> ToolmeshResult<Arc<ProcessSession>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ToolmeshError::Closed(format!(
                "MCP server '{}' is not running",
                self.server_id
            )));
        }
        self.session.lock().await.clone().ok_or_else(|| {
            ToolmeshError::Closed(format!("MCP server '{}' is not connected", self.server_id))
        })
    }

    async fn write_line(&self, session: &ProcessSession, msg: &str) -> ToolmeshResult<()> {
        let mut stdin = session.stdin.lock().await;
        let written = async {
            stdin.write_all(msg.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        written.map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            ToolmeshError::Closed(format!(
                "Failed to write to MCP server '{}': {e}",
                self.server_id
            ))
        })
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value> {
        let session = self.current().await?;
        let id = self.pending.next_id();
        let slot = self.pending.register(id);
        let msg = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        self.write_line(&session, &msg).await?;

        match slot.wait(method, self.request_timeout, cancel).await {
            Ok(resp) => rpc::into_result(resp, method),
            Err(err @ ToolmeshError::Cancelled(_)) => {
                let notice = serde_json::to_string(&JsonRpcNotification::cancelled(
                    id,
                    "caller cancelled",
                ))?;
                if let Err(e) = self.write_line(&session, &notice).await {
                    debug!(server = %self.server_id, error = %e, "Could not send cancellation");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ToolmeshResult<()> {
        let session = self.current().await?;
        let msg = serde_json::to_string(&notification)?;
        self.write_line(&session, &msg).await
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    fn is_multiplexed(&self) -> bool {
        false
    }

    async fn connect(&self) -> ToolmeshResult<()> {
        let session = Arc::new(self.spawn()?);
        *self.session.lock().await = Some(session);
        rpc::handshake(self, &self.server_id).await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.alive.load(Ordering::SeqCst)
    }

    async fn list_capabilities(&self) -> ToolmeshResult<Vec<Capability>> {
        rpc::list_tools(self).await
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value> {
        rpc::call_tool(self, name, arguments, cancel).await
    }

    async fn ping(&self) -> ToolmeshResult<()> {
        rpc::ping(self).await
    }

    async fn disconnect(&self) -> ToolmeshResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.reader.abort();
        self.pending.fail_all();

        let mut child = session.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!(server = %self.server_id, error = %e, "Failed to stop MCP server process");
        }
        debug!(server = %self.server_id, "MCP server process stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// A shell script that answers the handshake and one `tools/list`.
    const SCRIPTED_SERVER: &str = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"list_schemas","description":"List schemas"}]}}'
read line
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"public"}],"isError":false}}'
sleep 5
"#;

    fn scripted(script: &str, timeout: Duration) -> StdioTransport {
        StdioTransport::new(
            "scripted",
            "sh",
            vec!["-c".into(), script.into()],
            BTreeMap::new(),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_error() {
        let transport = StdioTransport::new(
            "broken",
            "/nonexistent/mcp-server",
            Vec::new(),
            BTreeMap::new(),
            Duration::from_secs(1),
        );
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, ToolmeshError::Connection(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_list_and_invoke() {
        let transport = scripted(SCRIPTED_SERVER, Duration::from_secs(5));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert!(!transport.is_multiplexed());

        let caps = transport.list_capabilities().await.unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "list_schemas");

        let result = transport
            .invoke("list_schemas", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "public");

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_keeps_connection() {
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
sleep 5
"#;
        let transport = scripted(script, Duration::from_millis(200));
        transport.connect().await.unwrap();
        let err = transport
            .invoke("slow", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolmeshError::Timeout(_)));
        assert!(transport.is_connected());
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_exit_marks_disconnected() {
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
read line
"#;
        let transport = scripted(script, Duration::from_secs(2));
        transport.connect().await.unwrap();
        for _ in 0..50 {
            if !transport.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!transport.is_connected());
        let err = transport
            .invoke("anything", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolmeshError::Closed(_)));
    }

    #[tokio::test]
    async fn test_oversized_line_drops_session() {
        let script = r#"
read line
head -c 200 /dev/zero | tr '\0' 'x'
sleep 5
"#;
        let transport = scripted(script, Duration::from_secs(2)).with_max_line_bytes(64);
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
        let err = transport
            .invoke("anything", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolmeshError::Closed(_)));
    }
}
