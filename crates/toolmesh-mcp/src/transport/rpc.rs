//! JSON-RPC plumbing shared by the transports: request/response correlation
//! and the MCP calls every transport makes the same way.

use crate::protocol::*;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use tracing::debug;

/// Upper bound on `tools/list` pages followed for one server.
const MAX_LIST_PAGES: usize = 64;

/// In-flight requests waiting for a response, keyed by JSON-RPC id.
#[derive(Debug)]
pub(crate) struct PendingRequests {
    map: parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicU64,
}

impl PendingRequests {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            map: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Reserve a slot for `id`. Dropping the slot forgets the request, so a
    /// late answer to a timed-out or cancelled call is discarded.
    pub(crate) fn register(self: &Arc<Self>, id: u64) -> PendingSlot {
        let (tx, rx) = oneshot::channel();
        self.map.lock().insert(id, tx);
        PendingSlot {
            id,
            rx,
            owner: Arc::clone(self),
        }
    }

    /// Hand a response to whoever waits for it. Returns `false` for
    /// responses nobody is waiting for.
    pub(crate) fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.response_id() else {
            return false;
        };
        match self.map.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(id, "Dropping response with no pending request");
                false
            }
        }
    }

    /// Wake every waiter with a closed-connection error.
    pub(crate) fn fail_all(&self) {
        self.map.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

pub(crate) struct PendingSlot {
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    owner: Arc<PendingRequests>,
}

impl PendingSlot {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, bounded by `timeout` and `cancel`.
    pub(crate) async fn wait(
        mut self,
        method: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<JsonRpcResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolmeshError::Cancelled(format!(
                "request '{method}' cancelled by caller"
            ))),
            received = tokio::time::timeout(timeout, &mut self.rx) => match received {
                Err(_) => Err(ToolmeshError::Timeout(format!(
                    "request '{method}' got no response within {}s",
                    timeout.as_secs_f64()
                ))),
                Ok(Err(_)) => Err(ToolmeshError::Closed(format!(
                    "connection dropped while waiting for '{method}'"
                ))),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.owner.map.lock().remove(&self.id);
    }
}

/// Turn a response into its `result`, mapping JSON-RPC errors.
pub(crate) fn into_result(response: JsonRpcResponse, method: &str) -> ToolmeshResult<Value> {
    if let Some(err) = response.error {
        return Err(ToolmeshError::Remote {
            code: err.code,
            message: err.message,
        });
    }
    response
        .result
        .ok_or_else(|| ToolmeshError::Protocol(format!("Empty {method} result")))
}

/// A request/notification channel to one MCP server.
#[async_trait]
pub(crate) trait RpcChannel: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value>;

    async fn notify(&self, notification: JsonRpcNotification) -> ToolmeshResult<()>;
}

/// `initialize` followed by `notifications/initialized`.
pub(crate) async fn handshake(
    channel: &dyn RpcChannel,
    server_id: &str,
) -> ToolmeshResult<InitializeResult> {
    let result = channel
        .request("initialize", Some(initialize_params()), &CancellationToken::new())
        .await?;
    let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
        ToolmeshError::Protocol(format!("Failed to parse initialize result: {e}"))
    })?;
    channel
        .notify(JsonRpcNotification::new("notifications/initialized", None))
        .await?;
    debug!(
        server = %server_id,
        version = %init.protocol_version,
        remote = init.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or(""),
        "MCP server initialized"
    );
    Ok(init)
}

/// Every capability the server advertises, following `nextCursor`.
pub(crate) async fn list_tools(channel: &dyn RpcChannel) -> ToolmeshResult<Vec<Capability>> {
    let cancel = CancellationToken::new();
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let result = channel
            .request("tools/list", list_params(cursor.as_deref()), &cancel)
            .await?;
        let page: ToolsPage = serde_json::from_value(result)
            .map_err(|e| ToolmeshError::Protocol(format!("Failed to parse tools: {e}")))?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }

    debug!(pages = MAX_LIST_PAGES, "Stopped following tools/list cursor");
    Ok(tools)
}

/// `tools/call`; a result flagged `isError` becomes a remote error.
pub(crate) async fn call_tool(
    channel: &dyn RpcChannel,
    name: &str,
    arguments: Value,
    cancel: &CancellationToken,
) -> ToolmeshResult<Value> {
    let result = channel
        .request("tools/call", Some(call_params(name, arguments)), cancel)
        .await?;
    if let Some(message) = tool_error_text(&result) {
        return Err(ToolmeshError::Remote { code: 0, message });
    }
    Ok(result)
}

pub(crate) async fn ping(channel: &dyn RpcChannel) -> ToolmeshResult<()> {
    channel
        .request("ping", None, &CancellationToken::new())
        .await
        .map(|_| ())
}
