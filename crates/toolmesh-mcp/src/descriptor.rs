//! Server descriptors: the raw config record and its validated form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use toolmesh_core::{ToolmeshError, ToolmeshResult};

/// Id of the descriptor synthesized when no server is configured.
pub const FALLBACK_SERVER_ID: &str = "default";

/// URL of the synthesized fallback server.
pub const FALLBACK_SERVER_URL: &str = "http://127.0.0.1:8000/mcp";

/// Wire transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON-RPC on stdin/stdout.
    LocalProcess,
    /// MCP streamable HTTP.
    HttpStream,
    /// MCP server-sent events.
    ServerPush,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::LocalProcess => write!(f, "local-process"),
            TransportKind::HttpStream => write!(f, "http-stream"),
            TransportKind::ServerPush => write!(f, "server-push"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ToolmeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-process" => Ok(TransportKind::LocalProcess),
            "http-stream" => Ok(TransportKind::HttpStream),
            "server-push" => Ok(TransportKind::ServerPush),
            other => Err(ToolmeshError::Config(format!(
                "Unknown transport '{other}' (expected local-process, http-stream or server-push)"
            ))),
        }
    }
}

/// A server entry exactly as it appears in a configuration layer.
///
/// All transport fields are optional here; [`ServerDescriptor::try_from`]
/// checks that the populated set matches `transport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique, non-empty server id.
    pub id: String,
    /// Display name; empty means "use the id".
    #[serde(default)]
    pub label: String,
    pub transport: TransportKind,
    /// Executable to spawn. `local-process` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for `command`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment for the child process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Endpoint URL. `http-stream` and `server-push` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Category hints for this server's tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl ServerRecord {
    fn bare(id: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            transport,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            categories: Vec::new(),
        }
    }

    /// A `local-process` record.
    pub fn local(id: impl Into<String>, command: impl Into<String>) -> Self {
        let mut record = Self::bare(id, TransportKind::LocalProcess);
        record.command = Some(command.into());
        record
    }

    /// An `http-stream` record.
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut record = Self::bare(id, TransportKind::HttpStream);
        record.url = Some(url.into());
        record
    }

    /// A `server-push` record.
    pub fn server_push(id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut record = Self::bare(id, TransportKind::ServerPush);
        record.url = Some(url.into());
        record
    }

    /// Set the display name.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }
}

/// Connection parameters for one transport kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// A child process speaking JSON-RPC over stdin/stdout.
    LocalProcess {
        /// Executable path or name.
        command: String,
        /// Process arguments.
        args: Vec<String>,
        /// Extra environment.
        env: BTreeMap<String, String>,
    },
    /// MCP streamable HTTP endpoint.
    HttpStream {
        /// Absolute `http(s)` URL.
        url: String,
    },
    /// Legacy MCP SSE endpoint.
    ServerPush {
        /// Absolute `http(s)` URL of the event stream.
        url: String,
    },
}

impl TransportConfig {
    /// The kind tag matching this variant.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::LocalProcess { .. } => TransportKind::LocalProcess,
            TransportConfig::HttpStream { .. } => TransportKind::HttpStream,
            TransportConfig::ServerPush { .. } => TransportKind::ServerPush,
        }
    }
}

/// A validated server entry.
///
/// Serializes in the flat [`ServerRecord`] shape; deserializing validates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ServerRecord", into = "ServerRecord")]
pub struct ServerDescriptor {
    /// Unique server id.
    pub id: String,
    /// Display name.
    pub label: String,
    /// How to reach the server.
    pub transport: TransportConfig,
    /// Category hints; the first one is assigned to every tool of this server.
    pub categories: Vec<String>,
}

impl ServerDescriptor {
    /// Transport kind of this server.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// First category hint, if the server declares any.
    pub fn category_hint(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    /// The descriptor used when configuration yields no servers at all.
    pub fn fallback() -> Self {
        Self {
            id: FALLBACK_SERVER_ID.to_string(),
            label: "Default MCP server".to_string(),
            transport: TransportConfig::HttpStream {
                url: FALLBACK_SERVER_URL.to_string(),
            },
            categories: Vec::new(),
        }
    }
}

impl TryFrom<ServerRecord> for ServerDescriptor {
    type Error = ToolmeshError;

    fn try_from(record: ServerRecord) -> ToolmeshResult<Self> {
        let id = record.id.trim().to_string();
        if id.is_empty() {
            return Err(ToolmeshError::Config("Server id must not be empty".into()));
        }

        let transport = match record.transport {
            TransportKind::LocalProcess => {
                if record.url.is_some() {
                    return Err(invalid(&id, "local-process servers take no 'url'"));
                }
                let command = record
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| invalid(&id, "local-process servers require 'command'"))?;
                TransportConfig::LocalProcess {
                    command,
                    args: record.args,
                    env: record.env,
                }
            }
            TransportKind::HttpStream | TransportKind::ServerPush => {
                if record.command.is_some() || !record.args.is_empty() || !record.env.is_empty() {
                    return Err(invalid(
                        &id,
                        &format!(
                            "{} servers take no 'command', 'args' or 'env'",
                            record.transport
                        ),
                    ));
                }
                let url = record
                    .url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        invalid(&id, &format!("{} servers require 'url'", record.transport))
                    })?;
                let parsed = reqwest::Url::parse(&url)
                    .map_err(|e| invalid(&id, &format!("invalid url '{url}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(invalid(&id, &format!("url '{url}' must be http or https")));
                }
                if record.transport == TransportKind::HttpStream {
                    TransportConfig::HttpStream { url }
                } else {
                    TransportConfig::ServerPush { url }
                }
            }
        };

        let label = if record.label.trim().is_empty() {
            id.clone()
        } else {
            record.label
        };

        let categories = record
            .categories
            .into_iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            id,
            label,
            transport,
            categories,
        })
    }
}

fn invalid(id: &str, reason: &str) -> ToolmeshError {
    ToolmeshError::Config(format!("Invalid server '{id}': {reason}"))
}

impl From<ServerDescriptor> for ServerRecord {
    fn from(descriptor: ServerDescriptor) -> Self {
        let kind = descriptor.kind();
        let mut record = ServerRecord::bare(descriptor.id, kind);
        record.label = descriptor.label;
        record.categories = descriptor.categories;
        match descriptor.transport {
            TransportConfig::LocalProcess { command, args, env } => {
                record.command = Some(command);
                record.args = args;
                record.env = env;
            }
            TransportConfig::HttpStream { url } | TransportConfig::ServerPush { url } => {
                record.url = Some(url);
            }
        }
        record
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_local_process_record_validates() {
        let record = ServerRecord::local("pg", "pg-mcp")
            .with_args(["--db", "main"])
            .with_env("PGHOST", "localhost");
        let desc = ServerDescriptor::try_from(record).unwrap();
        assert_eq!(desc.label, "pg");
        assert_eq!(desc.kind(), TransportKind::LocalProcess);
        match desc.transport {
            TransportConfig::LocalProcess { command, args, env } => {
                assert_eq!(command, "pg-mcp");
                assert_eq!(args, vec!["--db", "main"]);
                assert_eq!(env.get("PGHOST").unwrap(), "localhost");
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn test_missing_command_rejected() {
        let mut record = ServerRecord::local("pg", "x");
        record.command = None;
        let err = ServerDescriptor::try_from(record).unwrap_err();
        assert!(err.to_string().contains("require 'command'"), "{err}");
    }

    #[test]
    fn test_missing_url_rejected() {
        let mut record = ServerRecord::http("remote", "http://x");
        record.url = None;
        assert!(ServerDescriptor::try_from(record).is_err());
    }

    #[test]
    fn test_foreign_fields_rejected() {
        let mut record = ServerRecord::http("remote", "http://localhost:9000/mcp");
        record.command = Some("oops".into());
        assert!(ServerDescriptor::try_from(record).is_err());

        let mut record = ServerRecord::local("local", "srv");
        record.url = Some("http://localhost".into());
        assert!(ServerDescriptor::try_from(record).is_err());
    }

    #[test]
    fn test_bad_url_rejected() {
        assert!(ServerDescriptor::try_from(ServerRecord::http("a", "not a url")).is_err());
        assert!(ServerDescriptor::try_from(ServerRecord::server_push("a", "ftp://host/x")).is_err());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(ServerDescriptor::try_from(ServerRecord::local("  ", "srv")).is_err());
    }

    #[test]
    fn test_categories_normalized() {
        let record = ServerRecord::http("a", "https://example.com/mcp")
            .with_categories([" Query ", "", "database"]);
        let desc = ServerDescriptor::try_from(record).unwrap();
        assert_eq!(desc.categories, vec!["query", "database"]);
        assert_eq!(desc.category_hint(), Some("query"));
    }

    #[test]
    fn test_descriptor_serializes_flat() {
        let desc = ServerDescriptor::try_from(
            ServerRecord::server_push("events", "http://localhost:9000/sse").with_label("Events"),
        )
        .unwrap();
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["id"], "events");
        assert_eq!(json["transport"], "server-push");
        assert_eq!(json["url"], "http://localhost:9000/sse");
        assert!(json.get("command").is_none());
    }

    #[test]
    fn test_descriptor_deserialize_validates() {
        let bad: Result<ServerDescriptor, _> =
            serde_json::from_str(r#"{"id":"x","transport":"local-process"}"#);
        assert!(bad.is_err());
        let good: ServerDescriptor = serde_json::from_str(
            r#"{"id":"x","label":"X","transport":"http-stream","url":"http://h/mcp"}"#,
        )
        .unwrap();
        assert_eq!(good.kind(), TransportKind::HttpStream);
    }

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("server-push".parse::<TransportKind>().unwrap(), TransportKind::ServerPush);
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_fallback_descriptor() {
        let desc = ServerDescriptor::fallback();
        assert_eq!(desc.id, FALLBACK_SERVER_ID);
        assert_eq!(desc.kind(), TransportKind::HttpStream);
    }
}
