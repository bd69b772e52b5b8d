//! Streamable HTTP transport: every request is a POST whose reply is either
//! a JSON body or a short event stream carrying the response.

use super::rpc::{self, RpcChannel};
use super::Transport;
use crate::descriptor::TransportKind;
use crate::protocol::*;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use sse_stream::SseStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use tracing::{debug, warn};

/// Session header assigned by the server on `initialize`.
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// MCP client for a streamable HTTP endpoint. Multiplexed: each request
/// is its own HTTP exchange.
pub struct StreamableHttpTransport {
    server_id: String,
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    next_id: AtomicU64,
    session_id: parking_lot::RwLock<Option<String>>,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
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
            next_id: AtomicU64::new(1),
            session_id: parking_lot::RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Session id the server handed out, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(&self.url)
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(session) = self.session_id.read().as_deref() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    fn send_error(&self, e: reqwest::Error) -> ToolmeshError {
        if e.is_connect() {
            self.connected.store(false, Ordering::SeqCst);
            ToolmeshError::Closed(format!("MCP server '{}' unreachable: {e}", self.server_id))
        } else {
            ToolmeshError::Http(e.to_string())
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> ToolmeshResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            if let Some(session) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                *self.session_id.write() = Some(session.to_string());
            }
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND && self.session_id.read().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ToolmeshError::Closed(format!(
                "MCP session on '{}' expired",
                self.server_id
            )));
        }
        let body = response.text().await.unwrap_or_default();
        Err(ToolmeshError::Http(format!("HTTP {status}: {body}")))
    }

    async fn exchange(&self, request: &JsonRpcRequest) -> ToolmeshResult<JsonRpcResponse> {
        let response = self
            .post(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let response = self.check_status(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            return self.read_event_stream(response, request.id).await;
        }
        if response.status() == StatusCode::ACCEPTED || response.status() == StatusCode::NO_CONTENT {
            return Err(ToolmeshError::Protocol(format!(
                "server accepted '{}' without a response",
                request.method
            )));
        }
        let body = response.text().await.map_err(|e| self.send_error(e))?;
        serde_json::from_str(&body).map_err(|e| {
            ToolmeshError::Protocol(format!("Invalid JSON-RPC response to '{}': {e}", request.method))
        })
    }

    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> ToolmeshResult<JsonRpcResponse> {
        let mut stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();

        while let Some(event) = stream.next().await {
            let sse = event.map_err(|e| {
                ToolmeshError::Protocol(format!("Broken event stream from '{}': {e}", self.server_id))
            })?;
            let Some(data) = sse.data.as_deref() else {
                continue;
            };
            if let Some(resp) = self.match_event(data, id) {
                return Ok(resp);
            }
        }
        Err(ToolmeshError::Closed(format!(
            "event stream from '{}' ended before response {id}",
            self.server_id
        )))
    }

    fn match_event(&self, data: &str, id: u64) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcResponse>(data) {
            Ok(resp) if resp.response_id() == Some(id) => Some(resp),
            Ok(other) => {
                debug!(server = %self.server_id, method = ?other.method, "Skipping unrelated stream message");
                None
            }
            Err(e) => {
                debug!(server = %self.server_id, error = %e, "Non-JSON-RPC event from MCP server");
                None
            }
        }
    }

    fn send_cancellation(&self, id: u64) {
        let builder = self.post(&JsonRpcNotification::cancelled(id, "caller cancelled"));
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            if let Err(e) = builder.send().await {
                debug!(server = %server_id, error = %e, "Could not send cancellation");
            }
        });
    }
}

#[async_trait]
impl RpcChannel for StreamableHttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.send_cancellation(id);
                return Err(ToolmeshError::Cancelled(format!("request '{method}' cancelled by caller")));
            }
            outcome = tokio::time::timeout(self.request_timeout, self.exchange(&request)) => match outcome {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ToolmeshError::Timeout(format!(
                        "request '{method}' got no response within {}s",
                        self.request_timeout.as_secs_f64()
                    )));
                }
            },
        };
        rpc::into_result(response, method)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ToolmeshResult<()> {
        let response = self
            .post(&notification)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStream
    }

    fn is_multiplexed(&self) -> bool {
        true
    }

    async fn connect(&self) -> ToolmeshResult<()> {
        *self.session_id.write() = None;
        self.connected.store(true, Ordering::SeqCst);
        match rpc::handshake(self, &self.server_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(match e {
                    ToolmeshError::Closed(msg) => ToolmeshError::Connection(msg),
                    other => other,
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
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
        self.connected.store(false, Ordering::SeqCst);
        let session = self.session_id.write().take();
        if let Some(session) = session {
            let sent = self
                .http
                .delete(&self.url)
                .header(SESSION_HEADER, session)
                .timeout(self.request_timeout)
                .send()
                .await;
            if let Err(e) = sent {
                warn!(server = %self.server_id, error = %e, "Failed to end MCP session");
            }
        }
        Ok(())
    }
}
