mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::*;
use isolate_orchestrator::config::{ManagerConfig, SessionConfig};
use isolate_orchestrator::http_server::router;
use isolate_orchestrator::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    app_with_defaults(SessionConfig::default())
}

fn app_with_defaults(defaults: SessionConfig) -> Router {
    let manager = manager(
        vec![
            Arc::new(FakeBackend::container()),
            Arc::new(FakeBackend::process()),
        ],
        ManagerConfig::default(),
    );
    router(AppState::new(manager).with_session_defaults(defaults))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

#[tokio::test]
async fn health() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".into()));
}

#[tokio::test]
async fn session_round_trip() {
    let app = app();
    let (status, session) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"language": "python", "runtime_preference": "speed"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["runtime_type"], "permissioned_process");
    let id = session["id"].as_str().unwrap().to_string();

    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/execute"),
        Some(json!({"command": {"type": "execute_code", "code": "print('hi')"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true);
    assert_eq!(result["stdout"], "print('hi')");

    let (status, listed) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["execution_count"], 1);

    let (status, usage) = send(&app, Method::GET, &format!("/sessions/{id}/usage"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["usage"]["memory_bytes"], 4096);
    assert_eq!(usage["rate_limit"]["execution_count"], 1);

    let (status, _) = send(&app, Method::DELETE, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/execute"),
        Some(json!({"command": {"type": "execute_code", "code": "print(1)"}})),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["retryable"], false);

    let (status, _) = send(&app, Method::GET, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traversal_is_unprocessable_with_structured_reason() {
    let app = app();
    let (_, session) = send(&app, Method::POST, "/sessions", Some(json!({}))).await;
    let id = session["id"].as_str().unwrap().to_string();

    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/execute"),
        Some(json!({"command": {"type": "write_file", "path": "../../etc/passwd", "content": "x"}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(result["success"], false);
    assert_eq!(result["rejection"]["reason"], "validation_failed");
    assert_eq!(result["rejection"]["rule"], "path_traversal");

    let (status, entries) = send(
        &app,
        Method::GET,
        &format!("/audit?session_id={id}&event_type=security_violation"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn base64_content_is_decoded() {
    let app = app();
    let (_, session) = send(&app, Method::POST, "/sessions", Some(json!({}))).await;
    let id = session["id"].as_str().unwrap().to_string();

    // "print(42)"
    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/execute"),
        Some(json!({
            "command": {"type": "execute_code", "code": "cHJpbnQoNDIp"},
            "encoding": "base64"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["stdout"], "print(42)");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions/nope/execute",
        Some(json!({"command": {"type": "read_file", "path": "a.txt"}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = send(&app, Method::POST, "/sessions/nope/keepalive", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn runtimes_lists_registered_backends() {
    let app = app();
    let (status, runtimes) = send(&app, Method::GET, "/runtimes", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = runtimes
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["fake-container", "fake-process"]);
    assert_eq!(runtimes[0]["available"], true);
    assert_eq!(runtimes[1]["descriptor"]["startup_time_ms"], 50);
}

#[tokio::test]
async fn unsupported_language_is_service_unavailable() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"language": "cobol"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("cobol"));
}

#[tokio::test]
async fn clients_cannot_supply_security_settings() {
    let app = app();
    let (status, _) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({
            "language": "python",
            "security": {
                "enable_input_validation": false,
                "enable_rate_limiting": false,
                "enable_audit_logging": false,
                "sandbox_filesystem": false
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, listed) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn sessions_follow_the_operator_template() {
    let mut defaults = SessionConfig::default();
    defaults.security.allow_shell_commands = false;
    let app = app_with_defaults(defaults);

    let (status, session) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"language": "python", "user_id": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["config"]["security"]["allow_shell_commands"], false);
    let id = session["id"].as_str().unwrap().to_string();

    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/execute"),
        Some(json!({"command": {"type": "shell_command", "command": "ls", "args": []}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(result["rejection"]["reason"], "validation_failed");

    let (_, entries) = send(&app, Method::GET, &format!("/audit?session_id={id}"), None).await;
    let entries = entries.as_array().unwrap();
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e["user_id"] == "alice"));
}
