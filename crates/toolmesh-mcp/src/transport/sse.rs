//! Server-push transport: a long-lived event stream carries responses,
//! requests go out as POSTs to the endpoint the stream announces.

use super::rpc::{self, PendingRequests, RpcChannel};
use super::Transport;
use crate::descriptor::TransportKind;
use crate::protocol::*;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use sse_stream::SseStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use tracing::{debug, info, warn};

/// MCP client for a server-sent-events endpoint. Multiplexed: responses are
/// matched to requests by id as they arrive on the shared stream.
pub struct ServerPushTransport {
    server_id: String,
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    pending: Arc<PendingRequests>,
    /// Cleared when the event stream ends.
    alive: Arc<AtomicBool>,
    ready: AtomicBool,
    endpoint: parking_lot::RwLock<Option<Url>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServerPushTransport {
    /// A disconnected client; call [`Transport::connect`] to open it.
    pub fn new(
        server_id: impl Into<String>,
        url: impl Into<String>,
        http: reqwest::Client,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            http,
            request_timeout,
            pending: PendingRequests::new(),
            alive: Arc::new(AtomicBool::new(false)),
            ready: AtomicBool::new(false),
            endpoint: parking_lot::RwLock::new(None),
            reader: parking_lot::Mutex::new(None),
        }
    }

    /// The message endpoint announced by the server.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().clone()
    }

    async fn open_stream(&self) -> ToolmeshResult<Url> {
        let base = Url::parse(&self.url)
            .map_err(|e| ToolmeshError::Config(format!("Invalid server URL '{}': {e}", self.url)))?;

        let response = self
            .http
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                ToolmeshError::Connection(format!(
                    "Failed to open event stream for '{}': {e}",
                    self.server_id
                ))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolmeshError::Connection(format!(
                "Event stream for '{}' answered HTTP {status}",
                self.server_id
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("text/event-stream") {
            return Err(ToolmeshError::Connection(format!(
                "Event stream for '{}' has unexpected content type '{content_type}'",
                self.server_id
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        self.alive.store(true, Ordering::SeqCst);
        let pending = Arc::clone(&self.pending);
        let alive = Arc::clone(&self.alive);
        let server_id = self.server_id.clone();
        let reader = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(sse) => {
                        let kind = sse.event.as_deref().unwrap_or("message");
                        let data = sse.data.unwrap_or_default();
                        dispatch(&server_id, kind, data, &pending, &mut endpoint_tx);
                    }
                    Err(e) => {
                        warn!(server = %server_id, error = %e, "Event stream failed");
                        break;
                    }
                }
            }
            debug!(server = %server_id, "Event stream closed");
            alive.store(false, Ordering::SeqCst);
            pending.fail_all();
        });
        *self.reader.lock() = Some(reader);

        let announced = tokio::time::timeout(self.request_timeout, endpoint_rx)
            .await
            .map_err(|_| {
                ToolmeshError::Timeout(format!(
                    "'{}' did not announce a message endpoint",
                    self.server_id
                ))
            })?
            .map_err(|_| {
                ToolmeshError::Connection(format!(
                    "Event stream for '{}' closed before announcing an endpoint",
                    self.server_id
                ))
            })?;
        base.join(announced.trim()).map_err(|e| {
            ToolmeshError::Protocol(format!("Invalid message endpoint '{announced}': {e}"))
        })
    }

    fn target(&self) -> ToolmeshResult<Url> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ToolmeshError::Closed(format!(
                "event stream for '{}' is closed",
                self.server_id
            )));
        }
        self.endpoint.read().clone().ok_or_else(|| {
            ToolmeshError::Closed(format!("MCP server '{}' is not connected", self.server_id))
        })
    }

    async fn post(&self, target: Url, body: &impl serde::Serialize) -> ToolmeshResult<()> {
        let response = self
            .http
            .post(target)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ToolmeshError::Closed(format!("MCP server '{}' unreachable: {e}", self.server_id))
                } else {
                    ToolmeshError::Http(e.to_string())
                }
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ToolmeshError::Http(format!("HTTP {status}: {body}")))
    }
}

fn dispatch(
    server_id: &str,
    kind: &str,
    data: String,
    pending: &PendingRequests,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
) {
    match kind {
        "endpoint" => match endpoint_tx.take() {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!(server = %server_id, "Ignoring repeated endpoint event"),
        },
        "message" => match serde_json::from_str::<JsonRpcResponse>(&data) {
            Ok(msg) if msg.method.is_some() => {
                debug!(server = %server_id, method = ?msg.method, "Ignoring server-initiated message");
            }
            Ok(resp) => {
                pending.resolve(resp);
            }
            Err(e) => debug!(server = %server_id, error = %e, "Non-JSON-RPC event from MCP server"),
        },
        other => debug!(server = %server_id, event = %other, "Ignoring event"),
    }
}

#[async_trait]
impl RpcChannel for ServerPushTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value> {
        let target = self.target()?;
        let id = self.pending.next_id();
        let slot = self.pending.register(id);
        self.post(target.clone(), &JsonRpcRequest::new(id, method, params))
            .await?;

        match slot.wait(method, self.request_timeout, cancel).await {
            Ok(resp) => rpc::into_result(resp, method),
            Err(err @ ToolmeshError::Cancelled(_)) => {
                let notice = JsonRpcNotification::cancelled(id, "caller cancelled");
                if let Err(e) = self.post(target, &notice).await {
                    debug!(server = %self.server_id, error = %e, "Could not send cancellation");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ToolmeshResult<()> {
        let target = self.target()?;
        self.post(target, &notification).await
    }
}

#[async_trait]
impl Transport for ServerPushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerPush
    }

    fn is_multiplexed(&self) -> bool {
        true
    }

    async fn connect(&self) -> ToolmeshResult<()> {
        let endpoint = self.open_stream().await?;
        info!(server = %self.server_id, endpoint = %endpoint, "Event stream open");
        *self.endpoint.write() = Some(endpoint);
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
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        *self.endpoint.write() = None;
        self.pending.fail_all();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A minimal legacy-SSE MCP server: one GET stream, POSTs answered with
    /// 202 and their JSON-RPC replies pushed onto the stream.
    struct PushServer {
        url: String,
        posts: Arc<StdMutex<Vec<String>>>,
        stream_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<String>>>>,
    }

    impl PushServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/sse", listener.local_addr().unwrap());
            let posts = Arc::new(StdMutex::new(Vec::new()));
            let stream_tx = Arc::new(StdMutex::new(None));

            let server_posts = Arc::clone(&posts);
            let server_tx = Arc::clone(&stream_tx);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else { return };
                    let posts = Arc::clone(&server_posts);
                    let stream_tx = Arc::clone(&server_tx);
                    tokio::spawn(handle(socket, posts, stream_tx));
                }
            });

            Self { url, posts, stream_tx }
        }

        /// End the event stream as a crashed server would.
        fn close_stream(&self) {
            self.stream_tx.lock().unwrap().take();
        }
    }

    async fn read_request(socket: &mut TcpStream) -> (String, String) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed mid-request");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[head_end..head_end + length]).to_string();
        (head, body)
    }

    async fn handle(
        mut socket: TcpStream,
        posts: Arc<StdMutex<Vec<String>>>,
        stream_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<String>>>>,
    ) {
        let (head, body) = read_request(&mut socket).await;
        let request_line = head.lines().next().unwrap_or("").to_string();

        if request_line.starts_with("GET ") {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            *stream_tx.lock().unwrap() = Some(tx);
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n")
                .await
                .unwrap();
            // Endpoint event split across writes with CRLF line endings.
            socket.write_all(b"event: endpoint\r\nda").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket
                .write_all(b"ta: /messages?sessionId=s1\r\n\r\n")
                .await
                .unwrap();
            while let Some(frame) = rx.recv().await {
                if socket.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = socket.shutdown().await;
            return;
        }

        let path = request_line.split(' ').nth(1).unwrap_or("").to_string();
        posts.lock().unwrap().push(path);
        socket
            .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let msg: Value = serde_json::from_str(&body).unwrap();
        let Some(id) = msg.get("id").cloned() else { return };
        let result = match msg["method"].as_str().unwrap_or("") {
            "initialize" => serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "push", "version": "1"}
            }),
            "tools/list" => serde_json::json!({"tools": [{"name": "describe_table"}]}),
            "tools/call" => serde_json::json!({
                "content": [{"type": "text", "text": msg["params"]["arguments"]["table"]}]
            }),
            _ => serde_json::json!({}),
        };
        let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
        let frame = format!("event: message\ndata: {reply}\n\n");
        if let Some(tx) = stream_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    #[tokio::test]
    async fn test_full_session_over_event_stream() {
        let server = PushServer::start().await;
        let t = ServerPushTransport::new(
            "push",
            server.url.clone(),
            reqwest::Client::new(),
            Duration::from_secs(5),
        );

        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert!(t.is_multiplexed());
        let endpoint = t.endpoint().unwrap();
        assert_eq!(endpoint.path(), "/messages");
        assert_eq!(endpoint.query(), Some("sessionId=s1"));

        let caps = t.list_capabilities().await.unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "describe_table");

        let result = t
            .invoke(
                "describe_table",
                serde_json::json!({"table": "orders"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "orders");

        {
            let posts = server.posts.lock().unwrap();
            // initialize, notifications/initialized, tools/list, tools/call
            assert_eq!(posts.len(), 4);
            assert!(posts.iter().all(|p| p == "/messages?sessionId=s1"));
        }

        server.close_stream();
        for _ in 0..100 {
            if !t.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!t.is_connected());
        let err = t
            .invoke("describe_table", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolmeshError::Closed(_)));
    }

    #[tokio::test]
    async fn test_stream_without_endpoint_fails_connect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(": hello\n\n", "text/event-stream"))
            .mount(&server)
            .await;

        let t = ServerPushTransport::new(
            "push",
            format!("{}/sse", server.uri()),
            reqwest::Client::new(),
            Duration::from_secs(2),
        );
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, ToolmeshError::Connection(_)));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_wrong_content_type_fails_connect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let t = ServerPushTransport::new(
            "push",
            format!("{}/sse", server.uri()),
            reqwest::Client::new(),
            Duration::from_secs(2),
        );
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, ToolmeshError::Connection(_)));
    }

    #[test]
    fn test_dispatch_routes_endpoint_once() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let mut endpoint_tx = Some(tx);
        let data = "/messages?sessionId=abc".to_string();
        dispatch("push", "endpoint", data.clone(), &pending, &mut endpoint_tx);
        assert!(endpoint_tx.is_none());
        assert_eq!(rx.try_recv().unwrap(), "/messages?sessionId=abc");
        dispatch("push", "endpoint", data, &pending, &mut endpoint_tx);
    }

    #[tokio::test]
    async fn test_dispatch_resolves_message() {
        let pending = PendingRequests::new();
        let slot = pending.register(pending.next_id());
        let mut endpoint_tx = None;
        dispatch(
            "push",
            "message",
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#.into(),
            &pending,
            &mut endpoint_tx,
        );
        let resp = slot
            .wait("tools/list", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.result.is_some());
    }
}
