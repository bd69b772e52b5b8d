//! Core types and error definitions for toolmesh.
//!
//! This crate provides the types shared across the toolmesh crates: the
//! unified error enum and the host invocation boundary.
//!
//! # Main types
//!
//! - [`ToolmeshError`] - Unified error enum for all toolmesh subsystems.
//! - [`ToolmeshResult`] - Convenience alias for `Result<T, ToolmeshError>`.
//! - [`InvocationRequest`] - An abstract request to run a tool by name.
//! - [`InvocationResult`] - Success payload or a typed [`FailureKind`].

use serde::{Deserialize, Serialize};
use std::fmt;

// --- Error types ---

/// Top-level error type for toolmesh.
///
/// Errors below the router boundary use this type; the router converts
/// them into [`InvocationResult`] failures before they reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum ToolmeshError {
    /// A malformed or incomplete server descriptor, or an unreadable config layer.
    #[error("Config error: {0}")]
    Config(String),

    /// Spawning a process or reaching an endpoint failed during connect.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An I/O failure on an established transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No response arrived within the configured bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote server answered with an error.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code, or `0` for a tool-level `isError` result.
        code: i64,
        /// Message reported by the server.
        message: String,
    },

    /// The transport signalled that the connection is gone.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The caller cancelled the request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The server sent something that does not follow the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ToolmeshError`].
pub type ToolmeshResult<T> = Result<T, ToolmeshError>;

// --- Invocation types ---

/// A request from the host to invoke a tool by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Category the caller expects the tool to belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_hint: Option<String>,
    /// Restrict resolution to a single server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// JSON arguments forwarded to the tool untouched.
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::json!({})
}

impl InvocationRequest {
    /// Creates a request for `tool_name` with empty arguments.
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            domain_hint: None,
            server_id: None,
            arguments: empty_arguments(),
        }
    }

    /// Sets the domain hint.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain_hint = Some(domain.into());
        self
    }

    /// Pins resolution to one server.
    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Sets the argument payload.
    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// The class of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// No matching tool is in the catalog.
    NotFound,
    /// The owning server is not connected.
    Unreachable,
    /// The server failed to execute the tool, or the transport broke mid-call.
    RemoteError,
    /// No response within the request timeout.
    Timeout,
    /// The caller cancelled the call while it was in flight.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::NotFound => write!(f, "not-found"),
            FailureKind::Unreachable => write!(f, "unreachable"),
            FailureKind::RemoteError => write!(f, "remote-error"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of routing an [`InvocationRequest`].
///
/// Serializes as `{"ok": true, "payload": ...}` or
/// `{"ok": false, "kind": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireResult", into = "WireResult")]
pub enum InvocationResult {
    /// The tool ran; `payload` is the server's raw result.
    Success {
        /// Raw result as returned by the transport.
        payload: serde_json::Value,
    },
    /// The invocation failed before or during dispatch.
    Failure {
        /// Failure class.
        kind: FailureKind,
        /// Actionable, human-readable explanation.
        message: String,
    },
}

impl InvocationResult {
    /// Creates a successful result.
    pub fn success(payload: serde_json::Value) -> Self {
        Self::Success { payload }
    }

    /// Creates a failed result.
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` for [`InvocationResult::Success`].
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The failure class, if this is a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Short outcome label used in logs: `ok` or the failure kind.
    pub fn outcome(&self) -> String {
        match self {
            Self::Success { .. } => "ok".to_string(),
            Self::Failure { kind, .. } => kind.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResult {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<InvocationResult> for WireResult {
    fn from(result: InvocationResult) -> Self {
        match result {
            InvocationResult::Success { payload } => Self {
                ok: true,
                payload: Some(payload),
                kind: None,
                message: None,
            },
            InvocationResult::Failure { kind, message } => Self {
                ok: false,
                payload: None,
                kind: Some(kind),
                message: Some(message),
            },
        }
    }
}

impl TryFrom<WireResult> for InvocationResult {
    type Error = String;

    fn try_from(wire: WireResult) -> Result<Self, Self::Error> {
        if wire.ok {
            return Ok(Self::Success {
                payload: wire.payload.unwrap_or(serde_json::Value::Null),
            });
        }
        let kind = wire
            .kind
            .ok_or_else(|| "failed result is missing 'kind'".to_string())?;
        Ok(Self::Failure {
            kind,
            message: wire.message.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_arguments() {
        let req: InvocationRequest = serde_json::from_str(r#"{"toolName":"run_query"}"#).unwrap();
        assert_eq!(req.tool_name, "run_query");
        assert!(req.domain_hint.is_none());
        assert_eq!(req.arguments, serde_json::json!({}));
    }

    #[test]
    fn test_success_wire_shape() {
        let result = InvocationResult::success(serde_json::json!({"rows": 3}));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["payload"]["rows"], 3);
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_failure_wire_shape() {
        let result = InvocationResult::failure(FailureKind::NotFound, "no such tool");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["kind"], "not-found");
        assert_eq!(json["message"], "no such tool");
    }

    #[test]
    fn test_failure_without_kind_rejected() {
        let parsed: Result<InvocationResult, _> = serde_json::from_str(r#"{"ok":false}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(InvocationResult::success(serde_json::Value::Null).outcome(), "ok");
        assert_eq!(
            InvocationResult::failure(FailureKind::RemoteError, "x").outcome(),
            "remote-error"
        );
    }
}
