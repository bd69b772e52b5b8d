//! Config hot-reload watcher.
//!
//! Watches a `toolmesh.toml` file and invokes a callback with the freshly
//! parsed [`WatchedConfig`] after a debounce window.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use toolmesh_core::{ToolmeshError, ToolmeshResult};
use toolmesh_mcp::{HubSettings, LayerDocument};

/// The parts of the config file a running hub cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchedConfig {
    #[serde(default)]
    pub settings: HubSettings,
    #[serde(flatten)]
    pub layer: LayerDocument,
}

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// The parent directory is watched rather than the file itself, so editors
/// that save by renaming a temporary file are still seen. Dropping the
/// watcher stops the background thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// * `debounce_ms` -- minimum milliseconds between two reload callbacks.
    /// * `on_reload` -- called on a background thread each time the file
    ///   changes and still parses. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> ToolmeshResult<Self>
    where
        F: Fn(WatchedConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();
        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let dir = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if touches_config {
                let _ = tx.send(());
            }
        })
        .map_err(|e| ToolmeshError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ToolmeshError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Let the burst of writes from one save settle, then fold it
                // into a single reload.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read and parse a config file into a [`WatchedConfig`].
pub fn parse_config(path: &Path) -> ToolmeshResult<WatchedConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ToolmeshError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        ToolmeshError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}
