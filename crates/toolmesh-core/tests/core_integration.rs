#![allow(clippy::unwrap_used, clippy::expect_used)]

use toolmesh_core::*;

// ---------------------------------------------------------------------------
// 1. Request wire format
// ---------------------------------------------------------------------------

#[test]
fn request_uses_camel_case_fields() {
    let request = InvocationRequest::new("run_query")
        .with_domain("database")
        .with_server("ops")
        .with_arguments(serde_json::json!({"sql": "SELECT 1"}));

    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["toolName"], "run_query");
    assert_eq!(json["domainHint"], "database");
    assert_eq!(json["serverId"], "ops");
    assert_eq!(json["arguments"]["sql"], "SELECT 1");

    let back: InvocationRequest = serde_json::from_value(json).unwrap();
    assert_eq!(back, request);
}

#[test]
fn request_omits_unset_hints() {
    let json = serde_json::to_value(InvocationRequest::new("list_tables")).unwrap();
    assert!(json.get("domainHint").is_none());
    assert!(json.get("serverId").is_none());
    assert_eq!(json["arguments"], serde_json::json!({}));
}

// ---------------------------------------------------------------------------
// 2. Result wire format
// ---------------------------------------------------------------------------

#[test]
fn every_failure_kind_has_a_stable_label() {
    let kinds = [
        (FailureKind::NotFound, "not-found"),
        (FailureKind::Unreachable, "unreachable"),
        (FailureKind::RemoteError, "remote-error"),
        (FailureKind::Timeout, "timeout"),
        (FailureKind::Cancelled, "cancelled"),
    ];
    for (kind, label) in kinds {
        assert_eq!(kind.to_string(), label);
        let result = InvocationResult::failure(kind, "boom");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], label);
        assert_eq!(result.failure_kind(), Some(kind));
        assert!(!result.is_ok());
    }
}

#[test]
fn success_payload_is_untouched() {
    let payload = serde_json::json!({
        "content": [{"type": "text", "text": "3 rows"}],
        "structuredContent": {"rows": [1, 2, 3]},
    });
    let result = InvocationResult::success(payload.clone());
    let text = serde_json::to_string(&result).unwrap();
    let back: InvocationResult = serde_json::from_str(&text).unwrap();
    assert_eq!(back, InvocationResult::success(payload));
    assert!(back.is_ok());
    assert_eq!(back.failure_kind(), None);
}

#[test]
fn failed_result_parses_from_host_json() {
    let result: InvocationResult = serde_json::from_str(
        r#"{"ok": false, "kind": "unreachable", "message": "server 'ops' is down"}"#,
    )
    .unwrap();
    assert_eq!(
        result,
        InvocationResult::failure(FailureKind::Unreachable, "server 'ops' is down")
    );
}

// ---------------------------------------------------------------------------
// 3. Error conversions
// ---------------------------------------------------------------------------

#[test]
fn error_from_io_and_json() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: ToolmeshError = io.into();
    assert!(matches!(err, ToolmeshError::Io(_)));
    assert!(err.to_string().contains("pipe closed"));

    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: ToolmeshError = json_err.into();
    assert!(matches!(err, ToolmeshError::Json(_)));
}

#[test]
fn remote_error_display_includes_code() {
    let err = ToolmeshError::Remote {
        code: -32601,
        message: "Method not found".into(),
    };
    assert_eq!(err.to_string(), "Remote error -32601: Method not found");
}
