use crate::catalog::{CatalogSnapshot, ToolCatalog, ToolDescriptor};
use crate::manager::ConnectionManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{FailureKind, InvocationRequest, InvocationResult, ToolmeshError};
use tracing::{info, warn};
use uuid::Uuid;

/// How many tool names a not-found message lists before truncating.
const MAX_LISTED_NAMES: usize = 40;

const EMPTY_CATALOG_GUIDANCE: &str = "No tools are available: no MCP server is connected. \
Add one with `toolmesh servers add <id> --url <endpoint>` (or a `[[servers]]` entry in \
toolmesh.toml) and check that it is running.";

/// A log entry for one routed invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLogEntry {
    pub route_id: String,
    pub tool_name: String,
    pub server_id: Option<String>,
    /// `ok` or the failure kind.
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Counters over every routed invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub total_routes: u64,
    pub succeeded: u64,
    pub not_found: u64,
    pub unreachable: u64,
    pub remote_errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub total_duration_ms: u64,
}

impl RouteMetrics {
    fn record(&mut self, result: &InvocationResult, duration_ms: u64) {
        self.total_routes += 1;
        self.total_duration_ms += duration_ms;
        match result.failure_kind() {
            None => self.succeeded += 1,
            Some(FailureKind::NotFound) => self.not_found += 1,
            Some(FailureKind::Unreachable) => self.unreachable += 1,
            Some(FailureKind::RemoteError) => self.remote_errors += 1,
            Some(FailureKind::Timeout) => self.timeouts += 1,
            Some(FailureKind::Cancelled) => self.cancelled += 1,
        }
    }
}

/// Resolves invocation requests against the catalog and dispatches them
/// through the owning connection.
///
/// Never returns an error: every outcome is an [`InvocationResult`].
/// No retries are attempted.
pub struct ProxyRouter {
    catalog: Arc<ToolCatalog>,
    connections: Arc<ConnectionManager>,
    log: RwLock<VecDeque<RouteLogEntry>>,
    metrics: RwLock<RouteMetrics>,
    max_log_entries: usize,
}

impl ProxyRouter {
    pub fn new(catalog: Arc<ToolCatalog>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            catalog,
            connections,
            log: RwLock::new(VecDeque::new()),
            metrics: RwLock::new(RouteMetrics::default()),
            max_log_entries: 10_000,
        }
    }

    /// Cap the in-memory route log.
    pub fn with_max_log_entries(mut self, max: usize) -> Self {
        self.max_log_entries = max.max(1);
        self
    }

    pub async fn route(&self, request: InvocationRequest) -> InvocationResult {
        self.route_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Route a request; firing `cancel` aborts the in-flight call.
    pub async fn route_with_cancel(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> InvocationResult {
        let start = std::time::Instant::now();
        let route_id = Uuid::new_v4().to_string();

        let (server_id, result) = self.dispatch(&request, &cancel).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = result.outcome();
        let server = server_id.as_deref().unwrap_or("-");
        if result.is_ok() {
            info!(
                route = %route_id,
                tool = %request.tool_name,
                server = %server,
                outcome = %outcome,
                duration_ms,
                "Route complete"
            );
        } else {
            warn!(
                route = %route_id,
                tool = %request.tool_name,
                server = %server,
                outcome = %outcome,
                duration_ms,
                "Route failed"
            );
        }

        {
            let mut log = self.log.write().await;
            log.push_back(RouteLogEntry {
                route_id,
                tool_name: request.tool_name.clone(),
                server_id,
                outcome,
                timestamp: Utc::now(),
                duration_ms,
            });
            while log.len() > self.max_log_entries {
                log.pop_front();
            }
        }
        self.metrics.write().await.record(&result, duration_ms);

        result
    }

    async fn dispatch(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> (Option<String>, InvocationResult) {
        let snapshot = self.catalog.snapshot();
        if snapshot.is_empty() {
            return (
                request.server_id.clone(),
                InvocationResult::failure(FailureKind::NotFound, EMPTY_CATALOG_GUIDANCE),
            );
        }

        let Some(tool) = resolve(&snapshot, request).cloned() else {
            return (
                request.server_id.clone(),
                InvocationResult::failure(FailureKind::NotFound, not_found_message(&snapshot, request)),
            );
        };
        drop(snapshot);

        let server_id = tool.server_id.clone();
        let Some(conn) = self
            .connections
            .connection(&server_id)
            .filter(|c| c.is_connected())
        else {
            return (
                Some(server_id.clone()),
                InvocationResult::failure(
                    FailureKind::Unreachable,
                    format!(
                        "Server '{server_id}' owning tool '{}' is not connected. \
                         Check that it is running; it is retried on the next refresh.",
                        tool.name
                    ),
                ),
            );
        };

        let result = match conn
            .invoke(&tool.name, request.arguments.clone(), cancel)
            .await
        {
            Ok(payload) => InvocationResult::success(payload),
            Err(e) => failure_for(&tool, e),
        };
        (Some(server_id), result)
    }

    /// Most recent route log entries, newest first.
    pub async fn recent_logs(&self, limit: usize) -> Vec<RouteLogEntry> {
        let log = self.log.read().await;
        log.iter().rev().take(limit).cloned().collect()
    }

    pub async fn metrics(&self) -> RouteMetrics {
        self.metrics.read().await.clone()
    }

    /// Serialize router state as JSON (for monitoring).
    pub async fn to_json(&self) -> serde_json::Value {
        let metrics = self.metrics().await;
        let recent = self.recent_logs(10).await;
        serde_json::json!({
            "metrics": metrics,
            "recent_logs": recent,
        })
    }
}

/// Pick the tool a request names. A pinned server narrows the candidates;
/// a domain hint prefers candidates in that category; remaining ties go to
/// the lowest server id.
pub fn resolve<'a>(
    snapshot: &'a CatalogSnapshot,
    request: &InvocationRequest,
) -> Option<&'a ToolDescriptor> {
    let candidates: Vec<&ToolDescriptor> = match request.server_id.as_deref() {
        Some(server_id) => snapshot
            .get(server_id, &request.tool_name)
            .into_iter()
            .collect(),
        None => snapshot.find_by_name(&request.tool_name),
    };

    if let Some(hint) = request.domain_hint.as_deref() {
        let hint = hint.to_lowercase();
        if let Some(tool) = candidates.iter().find(|t| t.category == hint) {
            return Some(*tool);
        }
    }
    candidates.first().copied()
}

fn not_found_message(snapshot: &CatalogSnapshot, request: &InvocationRequest) -> String {
    let name = &request.tool_name;

    if let Some(server_id) = request.server_id.as_deref() {
        let names = tool_names(snapshot.by_server(server_id));
        if names.is_empty() {
            return format!(
                "Tool '{name}' not found: server '{server_id}' offers no tools. \
                 Available servers: {}",
                snapshot.servers().join(", ")
            );
        }
        return format!("Tool '{name}' not found on server '{server_id}'. Available tools there: {names}");
    }

    if let Some(hint) = request.domain_hint.as_deref() {
        let category = hint.to_lowercase();
        let names = tool_names(snapshot.by_category(&category));
        if names.is_empty() {
            return format!(
                "Tool '{name}' not found and no tools are in category '{category}'. \
                 Available categories: {}",
                snapshot.categories().join(", ")
            );
        }
        return format!("Tool '{name}' not found in category '{category}'. Available tools: {names}");
    }

    format!(
        "Tool '{name}' not found. Available tools: {}",
        tool_names(snapshot.iter().collect())
    )
}

fn tool_names(tools: Vec<&ToolDescriptor>) -> String {
    let names: BTreeSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    let total = names.len();
    let mut listed: Vec<&str> = names.into_iter().take(MAX_LISTED_NAMES).collect();
    if total > MAX_LISTED_NAMES {
        listed.push("...");
    }
    listed.join(", ")
}

fn failure_for(tool: &ToolDescriptor, error: ToolmeshError) -> InvocationResult {
    let (name, server) = (&tool.name, &tool.server_id);
    match error {
        ToolmeshError::Timeout(msg) => InvocationResult::failure(
            FailureKind::Timeout,
            format!("Tool '{name}' on server '{server}' timed out: {msg}"),
        ),
        ToolmeshError::Cancelled(msg) => InvocationResult::failure(
            FailureKind::Cancelled,
            format!("Tool '{name}' on server '{server}' was cancelled: {msg}"),
        ),
        ToolmeshError::Closed(msg) => InvocationResult::failure(
            FailureKind::Unreachable,
            format!("Server '{server}' went away while running '{name}': {msg}"),
        ),
        other => InvocationResult::failure(
            FailureKind::RemoteError,
            format!("Tool '{name}' on server '{server}' failed: {other}"),
        ),
    }
}
