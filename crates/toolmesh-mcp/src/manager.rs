use crate::descriptor::{ServerDescriptor, TransportKind};
use crate::protocol::Capability;
use crate::settings::HubSettings;
use crate::transport::{Transport, TransportFactory};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use tracing::{debug, info, warn};

/// Lifecycle state of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Was connected; the session has since ended.
    Disconnected,
    /// An open attempt is in flight.
    Connecting,
    /// Handshake done; calls may be dispatched.
    Connected,
    /// The last open attempt failed.
    Failed,
}

/// Status of one managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Server id from the descriptor.
    pub server_id: String,
    /// Display name from the descriptor.
    pub label: String,
    /// Transport kind in use.
    pub transport: TransportKind,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// When the current session was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// Most recent open or health-check failure.
    pub last_error: Option<String>,
    /// Connection attempts since the descriptor was first seen.
    pub attempts: u32,
}

/// What one sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Servers connected by this pass.
    pub opened: Vec<String>,
    /// Servers whose open attempt failed.
    pub failed: Vec<String>,
    /// Servers torn down because they left the registry or changed.
    pub closed: Vec<String>,
}

/// Internal state for a managed server.
struct Connection {
    descriptor: Arc<ServerDescriptor>,
    state: ConnectionState,
    client: Option<Arc<dyn Transport>>,
    gate: Option<Arc<Mutex<()>>>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    attempts: u32,
}

impl Connection {
    fn is_live(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.client.as_ref().is_some_and(|c| c.is_connected())
    }

    fn live_handle(&self) -> Option<LiveConnection> {
        if !self.is_live() {
            return None;
        }
        Some(LiveConnection {
            descriptor: Arc::clone(&self.descriptor),
            client: Arc::clone(self.client.as_ref()?),
            gate: self.gate.clone(),
        })
    }
}

/// A connected server, handed to the catalog and the router.
///
/// Calls through a non-multiplexed transport wait on a per-connection gate.
#[derive(Clone)]
pub struct LiveConnection {
    descriptor: Arc<ServerDescriptor>,
    client: Arc<dyn Transport>,
    gate: Option<Arc<Mutex<()>>>,
}

impl LiveConnection {
    pub fn server_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn list_capabilities(&self) -> ToolmeshResult<Vec<Capability>> {
        let _turn = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        self.client.list_capabilities().await
    }

    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> ToolmeshResult<Value> {
        let _turn = match &self.gate {
            Some(gate) => tokio::select! {
                guard = gate.lock() => Some(guard),
                _ = cancel.cancelled() => {
                    return Err(ToolmeshError::Cancelled(format!(
                        "call to '{name}' cancelled while queued"
                    )));
                }
            },
            None => None,
        };
        self.client.invoke(name, arguments, cancel).await
    }

    async fn ping(&self) -> ToolmeshResult<()> {
        let _turn = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        self.client.ping().await
    }
}

/// Owns one transport client per configured server and keeps the set in
/// line with the registry.
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    settings: HubSettings,
    connections: parking_lot::RwLock<BTreeMap<String, Connection>>,
    id_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pass: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, settings: HubSettings) -> Self {
        Self {
            factory,
            settings,
            connections: parking_lot::RwLock::new(BTreeMap::new()),
            id_locks: parking_lot::Mutex::new(HashMap::new()),
            pass: Mutex::new(()),
        }
    }

    async fn lock_id(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.id_locks.lock();
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Bring the connection set in line with `desired`.
    ///
    /// Opens every descriptor without a live connection (failed ones are
    /// retried), closes connections whose descriptor disappeared or
    /// changed. Failures are recorded and logged, never returned.
    pub async fn sync(&self, desired: Vec<ServerDescriptor>) -> SyncReport {
        let _pass = self.pass.lock().await;
        let desired: BTreeMap<String, ServerDescriptor> =
            desired.into_iter().map(|d| (d.id.clone(), d)).collect();

        let (to_close, to_open) = {
            let connections = self.connections.read();
            let to_close: Vec<String> = connections
                .iter()
                .filter(|(id, conn)| {
                    desired
                        .get(*id)
                        .map_or(true, |d| d != conn.descriptor.as_ref())
                })
                .map(|(id, _)| id.clone())
                .collect();
            let to_open: Vec<ServerDescriptor> = desired
                .values()
                .filter(|d| match connections.get(&d.id) {
                    Some(conn) => conn.descriptor.as_ref() != *d || !conn.is_live(),
                    None => true,
                })
                .cloned()
                .collect();
            (to_close, to_open)
        };

        let concurrency = self.settings.concurrency();
        let mut report = SyncReport {
            closed: to_close.clone(),
            ..SyncReport::default()
        };

        stream::iter(to_close)
            .map(|id| async move { self.close(&id).await })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let outcomes: Vec<(String, bool)> = stream::iter(to_open)
            .map(|descriptor| async move {
                let id = descriptor.id.clone();
                (id, self.open(descriptor).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (id, ok) in outcomes {
            if ok {
                report.opened.push(id);
            } else {
                report.failed.push(id);
            }
        }
        report.opened.sort();
        report.failed.sort();
        report
    }

    /// Open one server. Returns whether it ended up connected.
    async fn open(&self, descriptor: ServerDescriptor) -> bool {
        let id = descriptor.id.clone();
        let _guard = self.lock_id(&id).await;

        let stale = {
            let mut connections = self.connections.write();
            if let Some(existing) = connections.get(&id) {
                if existing.descriptor.as_ref() == &descriptor && existing.is_live() {
                    return true;
                }
            }
            let attempts = connections.get(&id).map_or(0, |c| c.attempts) + 1;
            let previous = connections.insert(
                id.clone(),
                Connection {
                    descriptor: Arc::new(descriptor.clone()),
                    state: ConnectionState::Connecting,
                    client: None,
                    gate: None,
                    connected_at: None,
                    last_error: None,
                    attempts,
                },
            );
            previous.and_then(|c| c.client)
        };
        if let Some(stale) = stale {
            if let Err(e) = stale.disconnect().await {
                debug!(server = %id, error = %e, "Error releasing stale transport");
            }
        }

        debug!(server = %id, transport = %descriptor.kind(), "Connecting MCP server");
        let result = match self.factory.create(&descriptor) {
            Ok(client) => {
                let timeout = self.settings.handshake_timeout();
                match tokio::time::timeout(timeout, client.connect()).await {
                    Ok(Ok(())) => Ok(client),
                    Ok(Err(e)) => {
                        release(&id, client.as_ref()).await;
                        Err(e.to_string())
                    }
                    Err(_) => {
                        release(&id, client.as_ref()).await;
                        Err(format!(
                            "handshake did not finish within {}s",
                            timeout.as_secs_f64()
                        ))
                    }
                }
            }
            Err(e) => Err(e.to_string()),
        };

        let mut connections = self.connections.write();
        let Some(conn) = connections.get_mut(&id) else {
            return false;
        };
        match result {
            Ok(client) => {
                info!(
                    server = %id,
                    transport = %descriptor.kind(),
                    attempts = conn.attempts,
                    "MCP server connected"
                );
                conn.gate = (!client.is_multiplexed()).then(|| Arc::new(Mutex::new(())));
                conn.client = Some(client);
                conn.state = ConnectionState::Connected;
                conn.connected_at = Some(Utc::now());
                true
            }
            Err(message) => {
                warn!(server = %id, error = %message, "Failed to connect MCP server");
                conn.state = ConnectionState::Failed;
                conn.last_error = Some(message);
                false
            }
        }
    }

    /// Tear down one server and forget it.
    async fn close(&self, id: &str) {
        let _guard = self.lock_id(id).await;
        let removed = self.connections.write().remove(id);
        if let Some(client) = removed.and_then(|c| c.client) {
            release(id, client.as_ref()).await;
            info!(server = %id, "MCP server disconnected");
        }
    }

    /// Handles for every connection that is currently live.
    pub fn live_connections(&self) -> Vec<LiveConnection> {
        self.connections
            .read()
            .values()
            .filter_map(Connection::live_handle)
            .collect()
    }

    /// The live connection for `server_id`, if there is one.
    pub fn connection(&self, server_id: &str) -> Option<LiveConnection> {
        self.connections.read().get(server_id)?.live_handle()
    }

    /// Find connections that went away. Live ones are pinged; a connection
    /// whose transport already reports closure is counted without a ping.
    /// Lost connections are marked disconnected so the next sync reopens
    /// them.
    pub async fn health_check(&self) -> Vec<String> {
        let mut lost: Vec<(String, String)> = Vec::new();
        let mut probes = Vec::new();
        {
            let connections = self.connections.read();
            for (id, conn) in connections.iter() {
                if conn.state != ConnectionState::Connected {
                    continue;
                }
                match conn.live_handle() {
                    Some(handle) => probes.push(handle),
                    None => lost.push((id.clone(), "connection closed".to_string())),
                }
            }
        }

        for conn in probes {
            let id = conn.server_id().to_string();
            let outcome =
                tokio::time::timeout(self.settings.request_timeout(), conn.ping()).await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(ToolmeshError::Remote { code, message })) => {
                    debug!(server = %id, code, message = %message, "Ping not supported");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "ping timed out".to_string(),
            };

            if conn.is_connected() {
                warn!(server = %id, error = %failure, "MCP health check failed");
                continue;
            }
            lost.push((id, failure));
        }

        let mut connections = self.connections.write();
        lost.into_iter()
            .map(|(id, failure)| {
                warn!(server = %id, error = %failure, "MCP server connection lost");
                if let Some(entry) = connections.get_mut(&id) {
                    entry.state = ConnectionState::Disconnected;
                    entry.last_error = Some(failure);
                }
                id
            })
            .collect()
    }

    /// Status of every managed server, ordered by id.
    pub fn status(&self) -> Vec<ConnectionStatus> {
        self.connections
            .read()
            .values()
            .map(|c| {
                let state = match c.state {
                    ConnectionState::Connected if !c.is_live() => ConnectionState::Disconnected,
                    other => other,
                };
                ConnectionStatus {
                    server_id: c.descriptor.id.clone(),
                    label: c.descriptor.label.clone(),
                    transport: c.descriptor.kind(),
                    state,
                    connected_at: c.connected_at,
                    last_error: c.last_error.clone(),
                    attempts: c.attempts,
                }
            })
            .collect()
    }

    /// Number of managed servers, connected or not.
    pub fn server_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        self.sync(Vec::new()).await;
    }
}

async fn release(id: &str, client: &dyn Transport) {
    if let Err(e) = client.disconnect().await {
        warn!(server = %id, error = %e, "Error while disconnecting MCP server");
    }
}
