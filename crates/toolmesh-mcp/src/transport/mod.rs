//! Transport clients: one per wire protocol, all behind [`Transport`].

pub mod http;
mod rpc;
pub mod sse;
pub mod stdio;

pub use http::StreamableHttpTransport;
pub use sse::ServerPushTransport;
pub use stdio::StdioTransport;

use crate::descriptor::{ServerDescriptor, TransportConfig, TransportKind};
use crate::protocol::Capability;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{ToolmeshError, ToolmeshResult};

/// A client session with one MCP server.
///
/// Implementations report failures as [`ToolmeshError`]; a
/// [`ToolmeshError::Closed`] means the session is gone and
/// [`Transport::is_connected`] now returns `false`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wire protocol of this client.
    fn kind(&self) -> TransportKind;

    /// Whether concurrent calls may share the session. Callers must
    /// serialize calls through transports that return `false`.
    fn is_multiplexed(&self) -> bool;

    /// Spawn or reach the server and complete the `initialize` exchange.
    async fn connect(&self) -> ToolmeshResult<()>;

    /// `true` between a successful `connect` and the session ending.
    fn is_connected(&self) -> bool;

    /// Every tool the server advertises.
    async fn list_capabilities(&self) -> ToolmeshResult<Vec<Capability>>;

    /// Run one tool. Returns the raw `tools/call` result.
    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value>;

    /// Liveness probe.
    async fn ping(&self) -> ToolmeshResult<()>;

    /// End the session and release its resources. Idempotent.
    async fn disconnect(&self) -> ToolmeshResult<()>;
}

/// Builds an unconnected [`Transport`] for a descriptor.
pub trait TransportFactory: Send + Sync {
    /// Create a client for `descriptor`; the caller connects it.
    fn create(&self, descriptor: &ServerDescriptor) -> ToolmeshResult<Arc<dyn Transport>>;
}

/// Factory for the three built-in transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl DefaultTransportFactory {
    /// A factory whose clients bound each request by `request_timeout`.
    pub fn new(request_timeout: Duration) -> ToolmeshResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("toolmesh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ToolmeshError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            request_timeout,
        })
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, descriptor: &ServerDescriptor) -> ToolmeshResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match &descriptor.transport {
            TransportConfig::LocalProcess { command, args, env } => Arc::new(StdioTransport::new(
                descriptor.id.clone(),
                command.clone(),
                args.clone(),
                env.clone(),
                self.request_timeout,
            )),
            TransportConfig::HttpStream { url } => Arc::new(StreamableHttpTransport::new(
                descriptor.id.clone(),
                url.clone(),
                self.http.clone(),
                self.request_timeout,
            )),
            TransportConfig::ServerPush { url } => Arc::new(ServerPushTransport::new(
                descriptor.id.clone(),
                url.clone(),
                self.http.clone(),
                self.request_timeout,
            )),
        };
        Ok(transport)
    }
}
