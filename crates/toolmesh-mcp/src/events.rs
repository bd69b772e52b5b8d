//! Change notifications for hosts that cache tool lists or prompts.

use serde::Serialize;
use tokio::sync::broadcast;

/// Something the host may want to refresh after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// The registry's descriptor set changed (add, remove or reload).
    RegistryChanged { server_ids: Vec<String> },
    /// A new catalog snapshot was installed.
    CatalogRefreshed {
        generation: u64,
        servers: usize,
        tools: usize,
    },
}

/// Broadcast hub shared by the registry and the catalog.
///
/// Sending never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}
