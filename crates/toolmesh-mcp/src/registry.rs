//! Server registry merged from layered configuration sources.

use crate::descriptor::{ServerDescriptor, ServerRecord};
use crate::events::{ChangeEvent, ChangeNotifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use tracing::{info, warn};

/// The server section of one configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDocument {
    /// Ids this layer removes from the layers below it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

/// One source of server records.
///
/// Layers are merged in order; a later layer overrides an earlier one per id.
#[async_trait]
pub trait ConfigLayer: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    async fn load(&self) -> ToolmeshResult<LayerDocument>;

    /// Persist a new document. Read-only layers keep the default.
    async fn store(&self, _doc: &LayerDocument) -> ToolmeshResult<()> {
        Err(ToolmeshError::Config(format!(
            "Config layer '{}' is read-only",
            self.name()
        )))
    }
}

/// In-memory layer. Writable, so it also serves as a user layer in tests.
pub struct StaticLayer {
    name: String,
    doc: parking_lot::RwLock<LayerDocument>,
}

impl StaticLayer {
    pub fn new(name: impl Into<String>, servers: Vec<ServerRecord>) -> Self {
        Self {
            name: name.into(),
            doc: parking_lot::RwLock::new(LayerDocument {
                servers,
                removed: Vec::new(),
            }),
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Current contents, as last stored.
    pub fn document(&self) -> LayerDocument {
        self.doc.read().clone()
    }
}

#[async_trait]
impl ConfigLayer for StaticLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> ToolmeshResult<LayerDocument> {
        Ok(self.doc.read().clone())
    }

    async fn store(&self, doc: &LayerDocument) -> ToolmeshResult<()> {
        *self.doc.write() = doc.clone();
        Ok(())
    }
}

/// A TOML file with `[[servers]]` tables and an optional `removed` list.
///
/// Other top-level tables (such as `[settings]`) are ignored when loading.
pub struct TomlFileLayer {
    name: String,
    path: PathBuf,
    required: bool,
}

impl TomlFileLayer {
    /// A layer whose file must exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            required: true,
        }
    }

    /// A layer whose missing file reads as empty. Used for the user layer.
    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            required: false,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConfigLayer for TomlFileLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> ToolmeshResult<LayerDocument> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !self.required => {
                return Ok(LayerDocument::default());
            }
            Err(e) => {
                return Err(ToolmeshError::Config(format!(
                    "Failed to read config '{}': {e}",
                    self.path.display()
                )))
            }
        };
        parse_layer(&content).map_err(|e| {
            ToolmeshError::Config(format!(
                "Failed to parse config '{}': {e}",
                self.path.display()
            ))
        })
    }

    async fn store(&self, doc: &LayerDocument) -> ToolmeshResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = toml::to_string_pretty(doc).map_err(|e| {
            ToolmeshError::Config(format!("Failed to serialize '{}': {e}", self.path.display()))
        })?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

/// Parse the server section out of a TOML document.
pub fn parse_layer(content: &str) -> Result<LayerDocument, toml::de::Error> {
    toml::from_str(content)
}

struct RegistryState {
    base_docs: Vec<LayerDocument>,
    user_doc: LayerDocument,
    merged: BTreeMap<String, ServerDescriptor>,
}

/// Holds the configured servers and persists user changes.
///
/// All mutation goes through one async mutex; readers get copies.
pub struct ServerRegistry {
    base: Vec<Arc<dyn ConfigLayer>>,
    user: Arc<dyn ConfigLayer>,
    state: Mutex<RegistryState>,
    notifier: ChangeNotifier,
}

impl ServerRegistry {
    /// `base` layers in ascending priority; `user` is the top, writable layer.
    pub fn new(
        base: Vec<Arc<dyn ConfigLayer>>,
        user: Arc<dyn ConfigLayer>,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            base,
            user,
            state: Mutex::new(RegistryState {
                base_docs: Vec::new(),
                user_doc: LayerDocument::default(),
                merged: BTreeMap::new(),
            }),
            notifier,
        }
    }

    /// Re-read every layer and rebuild the descriptor set.
    pub async fn load(&self) -> ToolmeshResult<Vec<ServerDescriptor>> {
        let mut state = self.state.lock().await;

        let mut base_docs = Vec::with_capacity(self.base.len());
        for layer in &self.base {
            base_docs.push(layer.load().await?);
        }
        let user_doc = self.user.load().await?;

        state.base_docs = base_docs;
        state.user_doc = user_doc;
        state.merged = merge(&state.base_docs, &state.user_doc);

        let descriptors: Vec<ServerDescriptor> = state.merged.values().cloned().collect();
        info!(servers = descriptors.len(), "Server registry loaded");
        self.announce(&state.merged);
        Ok(descriptors)
    }

    /// Insert or replace a server in the user layer.
    pub async fn add(&self, record: ServerRecord) -> ToolmeshResult<ServerDescriptor> {
        let descriptor = ServerDescriptor::try_from(record)?;
        let mut state = self.state.lock().await;

        let mut user_doc = state.user_doc.clone();
        let record = ServerRecord::from(descriptor.clone());
        match user_doc.servers.iter_mut().find(|r| r.id == descriptor.id) {
            Some(existing) => *existing = record,
            None => user_doc.servers.push(record),
        }
        user_doc.removed.retain(|id| id != &descriptor.id);

        self.user.store(&user_doc).await?;
        state.user_doc = user_doc;
        state.merged = merge(&state.base_docs, &state.user_doc);

        info!(server = %descriptor.id, transport = %descriptor.kind(), "Server added");
        self.announce(&state.merged);
        Ok(descriptor)
    }

    /// Delete a server. Ids that come from a base layer are masked in the
    /// user layer so they stay removed across reloads.
    pub async fn remove(&self, id: &str) -> ToolmeshResult<ServerDescriptor> {
        let mut state = self.state.lock().await;

        let in_user = state.user_doc.servers.iter().any(|r| r.id == id);
        let in_base = state
            .base_docs
            .iter()
            .any(|doc| doc.servers.iter().any(|r| r.id == id));
        let removed = match state.merged.get(id) {
            Some(desc) if in_user || in_base => desc.clone(),
            _ => {
                return Err(ToolmeshError::Config(format!(
                    "Server '{id}' is not configured in any layer"
                )))
            }
        };

        let mut user_doc = state.user_doc.clone();
        user_doc.servers.retain(|r| r.id != id);
        if in_base && !user_doc.removed.iter().any(|r| r == id) {
            user_doc.removed.push(id.to_string());
        }

        self.user.store(&user_doc).await?;
        state.user_doc = user_doc;
        state.merged = merge(&state.base_docs, &state.user_doc);

        info!(server = %id, "Server removed");
        self.announce(&state.merged);
        Ok(removed)
    }

    /// A copy of the current descriptor set, ordered by id.
    pub async fn list(&self) -> Vec<ServerDescriptor> {
        self.state.lock().await.merged.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.state.lock().await.merged.get(id).cloned()
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    fn announce(&self, merged: &BTreeMap<String, ServerDescriptor>) {
        self.notifier.notify(ChangeEvent::RegistryChanged {
            server_ids: merged.keys().cloned().collect(),
        });
    }
}

/// Merge layer documents in order; synthesize the fallback server when the
/// result is empty.
pub fn merge(base: &[LayerDocument], user: &LayerDocument) -> BTreeMap<String, ServerDescriptor> {
    let mut merged = BTreeMap::new();

    for doc in base.iter().chain(std::iter::once(user)) {
        for record in &doc.servers {
            match ServerDescriptor::try_from(record.clone()) {
                Ok(desc) => {
                    merged.insert(desc.id.clone(), desc);
                }
                Err(e) => warn!(server = %record.id, error = %e, "Skipping invalid server entry"),
            }
        }
        for id in &doc.removed {
            merged.remove(id);
        }
    }

    if merged.is_empty() {
        let fallback = ServerDescriptor::fallback();
        info!(server = %fallback.id, "No servers configured, using fallback server");
        merged.insert(fallback.id.clone(), fallback);
    }
    merged
}
