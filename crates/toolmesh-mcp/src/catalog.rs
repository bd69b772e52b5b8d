//! Tool catalog: enumerates live servers and publishes immutable snapshots.

use crate::classifier::{Classification, Domain};
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::manager::{ConnectionManager, LiveConnection};
use crate::protocol::Capability;
use crate::settings::HubSettings;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Category assigned when no pattern group matches.
pub const GENERAL_CATEGORY: &str = "general";

/// Name patterns per category, checked in order; the first group with a
/// pattern contained in the lowercased tool name wins.
const CATEGORY_PATTERNS: &[(&str, &[&str])] = &[
    (
        "query",
        &[
            "list", "get", "read", "search", "find", "describe", "show", "fetch", "select",
            "lookup",
        ],
    ),
    (
        "analysis",
        &[
            "analyze",
            "analyse",
            "generate",
            "summarize",
            "explain",
            "suggest",
            "optimize",
            "compare",
            "visualize",
            "forecast",
        ],
    ),
    (
        "database",
        &[
            "execute", "exec", "run", "insert", "update", "delete", "drop", "alter", "create",
            "write", "migrate",
        ],
    ),
];

/// Category of a tool: the server's hint when it has one, otherwise the
/// first pattern group matching the name.
pub fn categorize(tool_name: &str, server_hint: Option<&str>) -> String {
    if let Some(hint) = server_hint.map(str::trim).filter(|h| !h.is_empty()) {
        return hint.to_lowercase();
    }
    let name = tool_name.to_lowercase();
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| name.contains(p)))
        .map(|(category, _)| (*category).to_string())
        .unwrap_or_else(|| GENERAL_CATEGORY.to_string())
}

/// One tool offered by one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    pub description: String,
    /// Opaque JSON schema of the tool's arguments.
    pub input_schema: Value,
    pub category: String,
}

impl ToolDescriptor {
    /// `server/name`, unique across the catalog.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server_id, self.name)
    }
}

/// Capabilities one server reported during a pass.
#[derive(Debug, Clone)]
pub struct ServerTools {
    pub server_id: String,
    pub category_hint: Option<String>,
    pub capabilities: Vec<Capability>,
}

/// Immutable view of every discovered tool.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    tools: BTreeMap<(String, String), ToolDescriptor>,
    by_category: BTreeMap<String, Vec<(String, String)>>,
    servers: BTreeSet<String>,
}

impl CatalogSnapshot {
    /// Index the capabilities gathered in one pass.
    pub fn build(generation: u64, discovered: impl IntoIterator<Item = ServerTools>) -> Self {
        let mut snapshot = Self {
            generation,
            ..Self::default()
        };

        for server in discovered {
            for cap in server.capabilities {
                let key = (server.server_id.clone(), cap.name.clone());
                let tool = ToolDescriptor {
                    server_id: server.server_id.clone(),
                    category: categorize(&cap.name, server.category_hint.as_deref()),
                    name: cap.name,
                    description: cap.description,
                    input_schema: cap.input_schema,
                };
                if snapshot.tools.insert(key, tool).is_some() {
                    debug!(server = %server.server_id, "Duplicate tool name, keeping the last one");
                }
            }
            snapshot.servers.insert(server.server_id);
        }

        for (key, tool) in &snapshot.tools {
            snapshot
                .by_category
                .entry(tool.category.clone())
                .or_default()
                .push(key.clone());
        }
        snapshot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Servers enumerated in this pass, including ones with no tools.
    pub fn servers(&self) -> Vec<String> {
        self.servers.iter().cloned().collect()
    }

    pub fn get(&self, server_id: &str, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(&(server_id.to_string(), name.to_string()))
    }

    /// Every tool called `name`, ordered by server id.
    pub fn find_by_name(&self, name: &str) -> Vec<&ToolDescriptor> {
        self.tools.values().filter(|t| t.name == name).collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<&ToolDescriptor> {
        self.by_category
            .get(category)
            .map(|keys| keys.iter().filter_map(|k| self.tools.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn by_server(&self, server_id: &str) -> Vec<&ToolDescriptor> {
        self.tools
            .values()
            .filter(|t| t.server_id == server_id)
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        self.by_category.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }
}

/// Discovers tools on the live connections and serves lookups from the
/// latest snapshot.
pub struct ToolCatalog {
    connections: Arc<ConnectionManager>,
    settings: HubSettings,
    current: parking_lot::RwLock<Arc<CatalogSnapshot>>,
    passes: AtomicU64,
    notifier: ChangeNotifier,
}

impl ToolCatalog {
    pub fn new(
        connections: Arc<ConnectionManager>,
        settings: HubSettings,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            connections,
            settings,
            current: parking_lot::RwLock::new(Arc::new(CatalogSnapshot::default())),
            passes: AtomicU64::new(0),
            notifier,
        }
    }

    /// Enumerate every live connection and install the result.
    ///
    /// A server that fails or times out is logged and left out. If a pass
    /// that started later has already installed its snapshot, this pass's
    /// result is dropped and the newer snapshot is returned.
    pub async fn refresh(&self) -> Arc<CatalogSnapshot> {
        let generation = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.connections.live_connections();
        let timeout = self.settings.discovery_timeout();

        let discovered: Vec<Option<ServerTools>> = stream::iter(live)
            .map(|conn| discover(conn, timeout))
            .buffer_unordered(self.settings.concurrency())
            .collect()
            .await;

        let snapshot = Arc::new(CatalogSnapshot::build(
            generation,
            discovered.into_iter().flatten(),
        ));

        {
            let mut current = self.current.write();
            if current.generation() > generation {
                debug!(
                    generation,
                    installed = current.generation(),
                    "Discarding superseded discovery pass"
                );
                return Arc::clone(&current);
            }
            *current = Arc::clone(&snapshot);
        }

        info!(
            generation,
            servers = snapshot.servers.len(),
            tools = snapshot.len(),
            "Tool catalog refreshed"
        );
        self.notifier.notify(ChangeEvent::CatalogRefreshed {
            generation,
            servers: snapshot.servers.len(),
            tools: snapshot.len(),
        });
        snapshot
    }

    /// The snapshot currently installed.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// A tool by name, optionally pinned to one server. Without a server id
    /// the lowest server id offering the name wins.
    pub fn lookup_by_name(&self, name: &str, server_id: Option<&str>) -> Option<ToolDescriptor> {
        let snapshot = self.snapshot();
        match server_id {
            Some(id) => snapshot.get(id, name).cloned(),
            None => snapshot.find_by_name(name).first().map(|t| (*t).clone()),
        }
    }

    pub fn by_category(&self, category: &str) -> Vec<ToolDescriptor> {
        self.snapshot()
            .by_category(category)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn by_server(&self, server_id: &str) -> Vec<ToolDescriptor> {
        self.snapshot()
            .by_server(server_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        self.snapshot().categories()
    }

    /// Categories that currently have at least one tool.
    pub fn available_domains(&self) -> Vec<String> {
        self.categories()
    }

    pub fn list_all(&self) -> Vec<ToolDescriptor> {
        self.snapshot().iter().cloned().collect()
    }

    /// Tools relevant to a classified request: those of the primary and
    /// secondary domains, or everything when nothing matched.
    pub fn select_for(&self, classification: &Classification) -> Vec<ToolDescriptor> {
        if classification.primary == Domain::General {
            return self.list_all();
        }
        let snapshot = self.snapshot();
        std::iter::once(classification.primary)
            .chain(classification.secondary.iter().copied())
            .flat_map(|domain| snapshot.by_category(domain.as_str()))
            .cloned()
            .collect()
    }
}

async fn discover(conn: LiveConnection, timeout: std::time::Duration) -> Option<ServerTools> {
    let server_id = conn.server_id().to_string();
    match tokio::time::timeout(timeout, conn.list_capabilities()).await {
        Ok(Ok(capabilities)) => {
            debug!(server = %server_id, tools = capabilities.len(), "MCP tools discovered");
            Some(ServerTools {
                category_hint: conn.descriptor().category_hint().map(str::to_string),
                server_id,
                capabilities,
            })
        }
        Ok(Err(e)) => {
            warn!(server = %server_id, error = %e, "Tool discovery failed");
            None
        }
        Err(_) => {
            warn!(
                server = %server_id,
                timeout_secs = timeout.as_secs_f64(),
                "Tool discovery timed out"
            );
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cap(name: &str) -> Capability {
        Capability {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn server(id: &str, hint: Option<&str>, names: &[&str]) -> ServerTools {
        ServerTools {
            server_id: id.to_string(),
            category_hint: hint.map(str::to_string),
            capabilities: names.iter().map(|n| cap(n)).collect(),
        }
    }

    #[test]
    fn test_categorize_pattern_order() {
        assert_eq!(categorize("list_schemas", None), "query");
        assert_eq!(categorize("get_table_info", None), "query");
        assert_eq!(categorize("analyze_sales", None), "analysis");
        assert_eq!(categorize("run_query", None), "database");
        assert_eq!(categorize("execute_sql", None), "database");
        assert_eq!(categorize("ping", None), GENERAL_CATEGORY);
    }

    #[test]
    fn test_first_matching_group_wins() {
        // "list" (query) is checked before "create" (database).
        assert_eq!(categorize("create_list", None), "query");
        // "generate" (analysis) is checked before "write" (database).
        assert_eq!(categorize("generate_and_write", None), "analysis");
    }

    #[test]
    fn test_server_hint_overrides_patterns() {
        assert_eq!(categorize("list_schemas", Some("Database")), "database");
        assert_eq!(categorize("list_schemas", Some("  ")), "query");
    }

    #[test]
    fn test_snapshot_indices() {
        let snapshot = CatalogSnapshot::build(
            1,
            vec![
                server("db", None, &["list_schemas", "run_query"]),
                server("docs", Some("analysis"), &["list_schemas"]),
                server("empty", None, &[]),
            ],
        );
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.servers(), vec!["db", "docs", "empty"]);

        let dupes: Vec<_> = snapshot
            .find_by_name("list_schemas")
            .iter()
            .map(|t| t.server_id.as_str())
            .collect();
        assert_eq!(dupes, vec!["db", "docs"]);

        assert_eq!(snapshot.by_category("query").len(), 1);
        assert_eq!(snapshot.by_category("analysis")[0].server_id, "docs");
        assert_eq!(snapshot.by_category("database")[0].name, "run_query");
        assert!(snapshot.by_server("empty").is_empty());
        assert_eq!(snapshot.categories(), vec!["analysis", "database", "query"]);
        assert_eq!(
            snapshot.get("db", "run_query").unwrap().qualified_name(),
            "db/run_query"
        );
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = CatalogSnapshot::default();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation(), 0);
        assert!(snapshot.categories().is_empty());
    }
}
