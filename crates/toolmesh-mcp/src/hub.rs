//! Wires registry, connections, catalog and router into one handle.

use crate::catalog::{CatalogSnapshot, ToolCatalog};
use crate::classifier::{Classification, RequestClassifier};
use crate::descriptor::{ServerDescriptor, ServerRecord};
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::manager::{ConnectionManager, SyncReport};
use crate::registry::{ConfigLayer, ServerRegistry};
use crate::router::ProxyRouter;
use crate::settings::HubSettings;
use crate::transport::{DefaultTransportFactory, TransportFactory};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{InvocationRequest, InvocationResult, ToolmeshResult};
use tracing::{debug, info};

/// The discovery, catalog and routing core behind one handle.
///
/// Registry mutations only change configuration; run [`ToolHub::sync`]
/// (or [`ToolHub::spawn_sync_loop`]) to apply them to the connections and
/// the catalog.
pub struct ToolHub {
    settings: HubSettings,
    notifier: ChangeNotifier,
    registry: Arc<ServerRegistry>,
    connections: Arc<ConnectionManager>,
    catalog: Arc<ToolCatalog>,
    router: Arc<ProxyRouter>,
    classifier: RequestClassifier,
    /// Cancelled by [`ToolHub::shutdown`]; stops the spawned loops.
    background: CancellationToken,
}

impl ToolHub {
    /// A hub using the built-in transports.
    pub fn new(
        settings: HubSettings,
        base: Vec<Arc<dyn ConfigLayer>>,
        user: Arc<dyn ConfigLayer>,
    ) -> ToolmeshResult<Self> {
        let factory = Arc::new(DefaultTransportFactory::new(settings.request_timeout())?);
        Ok(Self::with_factory(settings, base, user, factory))
    }

    /// A hub whose transports come from `factory`.
    pub fn with_factory(
        settings: HubSettings,
        base: Vec<Arc<dyn ConfigLayer>>,
        user: Arc<dyn ConfigLayer>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let notifier = ChangeNotifier::new(settings.event_capacity);
        let registry = Arc::new(ServerRegistry::new(base, user, notifier.clone()));
        let connections = Arc::new(ConnectionManager::new(factory, settings.clone()));
        let catalog = Arc::new(ToolCatalog::new(
            Arc::clone(&connections),
            settings.clone(),
            notifier.clone(),
        ));
        let router = Arc::new(ProxyRouter::new(
            Arc::clone(&catalog),
            Arc::clone(&connections),
        ));
        Self {
            settings,
            notifier,
            registry,
            connections,
            catalog,
            router,
            classifier: RequestClassifier::new(),
            background: CancellationToken::new(),
        }
    }

    /// Load the registry, connect every server and build the first catalog.
    pub async fn start(&self) -> ToolmeshResult<Arc<CatalogSnapshot>> {
        self.registry.load().await?;
        Ok(self.sync().await)
    }

    /// Re-read the configuration layers and apply the result.
    pub async fn reload(&self) -> ToolmeshResult<Arc<CatalogSnapshot>> {
        self.start().await
    }

    /// Reconcile connections with the registry, then re-enumerate tools.
    pub async fn sync(&self) -> Arc<CatalogSnapshot> {
        let desired = self.registry.list().await;
        let report: SyncReport = self.connections.sync(desired).await;
        debug!(
            opened = report.opened.len(),
            failed = report.failed.len(),
            closed = report.closed.len(),
            "Connection sync finished"
        );
        self.catalog.refresh().await
    }

    pub async fn add_server(&self, record: ServerRecord) -> ToolmeshResult<ServerDescriptor> {
        self.registry.add(record).await
    }

    pub async fn remove_server(&self, id: &str) -> ToolmeshResult<ServerDescriptor> {
        self.registry.remove(id).await
    }

    pub async fn route(&self, request: InvocationRequest) -> InvocationResult {
        self.router.route(request).await
    }

    pub async fn route_with_cancel(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> InvocationResult {
        self.router.route_with_cancel(request, cancel).await
    }

    pub fn classify(&self, text: &str) -> Classification {
        self.classifier.classify(text)
    }

    /// Registry and catalog change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    /// Run [`ToolHub::sync`] after every registry change. A burst of
    /// changes is folded into one pass. Stops on [`ToolHub::shutdown`].
    pub fn spawn_sync_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut rx = self.notifier.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = hub.background.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(ChangeEvent::RegistryChanged { .. }) | Err(RecvError::Lagged(_)) => {
                        loop {
                            match rx.try_recv() {
                                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                        hub.sync().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Periodically health-check the connections and re-sync, so failed
    /// servers are retried and tool lists stay fresh. `None` when the
    /// refresh interval is disabled. Stops on [`ToolHub::shutdown`].
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.settings.refresh_interval()?;
        let hub = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = hub.background.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let lost = hub.connections.health_check().await;
                if !lost.is_empty() {
                    info!(servers = ?lost, "Reconnecting lost MCP servers");
                }
                hub.sync().await;
            }
        }))
    }

    /// Stop the background loops and close every connection.
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.connections.shutdown().await;
        info!("Tool hub shut down");
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.router
    }
}
