//! MCP tool discovery, cataloguing and proxy routing.
//!
//! A [`ServerRegistry`] merges layered configuration into the set of MCP
//! servers to use. The [`ConnectionManager`] keeps one live connection per
//! server over stdio, streamable HTTP or SSE. The [`ToolCatalog`]
//! enumerates their tools into an immutable snapshot, and the
//! [`ProxyRouter`] resolves invocation requests against that snapshot and
//! forwards them. [`ToolHub`] wires the pieces together.

pub mod catalog;
pub mod classifier;
pub mod descriptor;
pub mod events;
pub mod hub;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod settings;
pub mod transport;

pub use catalog::{categorize, CatalogSnapshot, ToolCatalog, ToolDescriptor};
pub use classifier::{Classification, Domain, RequestClassifier};
pub use descriptor::{ServerDescriptor, ServerRecord, TransportConfig, TransportKind};
pub use events::{ChangeEvent, ChangeNotifier};
pub use hub::ToolHub;
pub use manager::{ConnectionManager, ConnectionState, ConnectionStatus, LiveConnection, SyncReport};
pub use registry::{ConfigLayer, LayerDocument, ServerRegistry, StaticLayer, TomlFileLayer};
pub use router::{ProxyRouter, RouteLogEntry, RouteMetrics};
pub use settings::HubSettings;
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
