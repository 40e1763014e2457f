//! HTTP server implementation using Axum.

use crate::config::SessionConfig;
use crate::error::SandboxError;
use crate::runtime::{
    Command, CommandResult, ResourceUsage, RuntimeStatus, RuntimeType, SelectionPreference,
};
use crate::security::{AuditEntry, AuditEventType, RateLimitStatus};
use crate::session::Session;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Error body returned by every failing route.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &SandboxError) -> StatusCode {
    match error {
        SandboxError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::SessionClosed(_) => StatusCode::GONE,
        SandboxError::SessionNotLocal(_) => StatusCode::MISDIRECTED_REQUEST,
        SandboxError::LockTimeout { .. } => StatusCode::CONFLICT,
        SandboxError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        SandboxError::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SandboxError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SandboxError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        SandboxError::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn with_retry_after(mut response: Response, error: &SandboxError) -> Response {
    if let SandboxError::RateLimited {
        retry_after_secs, ..
    } = error
    {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
    }
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        let response = (status_for(&self.0), Json(body)).into_response();
        with_retry_after(response, &self.0)
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct SessionInfo {
    #[serde(flatten)]
    session: Session,
    age_secs: i64,
    idle_secs: i64,
}

impl From<Session> for SessionInfo {
    fn from(session: Session) -> Self {
        let now = Utc::now();
        Self {
            age_secs: (now - session.created_at).num_seconds(),
            idle_secs: (now - session.last_activity).num_seconds(),
            session,
        }
    }
}

/// What a client may choose when opening a session. Everything else,
/// security settings and resource limits included, comes from the operator
/// template in [`AppState::session_defaults`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CreateSessionRequest {
    language: Option<String>,
    runtime_preference: Option<SelectionPreference>,
    runtime_type: Option<RuntimeType>,
    idle_timeout_minutes: Option<u32>,
    max_lifetime_minutes: Option<u32>,
    persist_filesystem: Option<bool>,
    user_id: Option<String>,
}

impl CreateSessionRequest {
    /// Timeouts may only be shortened.
    fn into_config(self, defaults: &SessionConfig) -> SessionConfig {
        let mut config = defaults.clone();
        if let Some(language) = self.language {
            config.language = language;
        }
        if let Some(preference) = self.runtime_preference {
            config.runtime_preference = Some(preference);
        }
        if let Some(runtime_type) = self.runtime_type {
            config.runtime_type = Some(runtime_type);
        }
        if let Some(minutes) = self.idle_timeout_minutes {
            config.idle_timeout_minutes = minutes.min(defaults.idle_timeout_minutes);
        }
        if let Some(minutes) = self.max_lifetime_minutes {
            config.max_lifetime_minutes = minutes.min(defaults.max_lifetime_minutes);
        }
        if let Some(persist) = self.persist_filesystem {
            config.persist_filesystem = persist;
        }
        if self.user_id.is_some() {
            config.user_id = self.user_id;
        }
        config
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: Command,
    /// Encoding of `code` / `content` in the command.
    #[serde(default)]
    encoding: ContentEncoding,
}

#[derive(Serialize)]
struct UsageResponse {
    session_id: String,
    usage: Option<ResourceUsage>,
    rate_limit: Option<RateLimitStatus>,
}

#[derive(Deserialize)]
struct AuditQuery {
    session_id: Option<String>,
    event_type: Option<AuditEventType>,
    limit: Option<usize>,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/execute", post(execute_in_session))
        .route("/sessions/:id/keepalive", post(keepalive))
        .route("/sessions/:id/usage", get(session_usage))
        .route("/runtimes", get(list_runtimes))
        .route("/audit", get(audit))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server until the shutdown token in `state` is cancelled.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let config = request.into_config(&state.session_defaults);
    let session = state
        .manager
        .create_session(config, &state.request_token())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionInfo>>> {
    let sessions = state.manager.list_sessions().await?;
    Ok(Json(sessions.into_iter().map(SessionInfo::from).collect()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    match state.manager.get_session(&id).await? {
        Some(session) => Ok(Json(session.into())),
        None => Err(SandboxError::SessionNotFound(id).into()),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .close_session(&id, &state.request_token())
        .await?;
    info!("Deleted session: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_in_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Response> {
    let command = decode_command(req.command, req.encoding)?;
    let result = state
        .manager
        .execute_in_session(&id, &command, &state.request_token())
        .await?;
    Ok(result_response(result))
}

async fn keepalive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let session = state.manager.touch_session(&id).await?;
    Ok(Json(session.into()))
}

async fn session_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<UsageResponse>> {
    let usage = state.manager.get_session_resource_usage(&id).await?;
    Ok(Json(UsageResponse {
        rate_limit: state.manager.rate_limit_status(&id),
        session_id: id,
        usage,
    }))
}

async fn list_runtimes(State(state): State<AppState>) -> ApiResult<Json<Vec<RuntimeStatus>>> {
    let runtimes = state
        .manager
        .selector()
        .describe(&state.request_token())
        .await?;
    Ok(Json(runtimes))
}

async fn audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEntry>> {
    let log = state.manager.audit_log();
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    let entries = match (query.session_id, query.event_type) {
        (Some(session_id), Some(event_type)) => {
            log.for_session_and_type(&session_id, event_type, limit)
        }
        (Some(session_id), None) => log.for_session(&session_id, limit),
        (None, Some(event_type)) => log.by_event_type(event_type, limit),
        (None, None) => log.recent(limit),
    };
    Json(entries)
}

/// Rejections keep their structured body but carry the status of the
/// matching error.
fn result_response(result: CommandResult) -> Response {
    let Some(rejection) = result.rejection.clone() else {
        return Json(result).into_response();
    };
    let error = rejection.into_error();
    let response = (status_for(&error), Json(result)).into_response();
    with_retry_after(response, &error)
}

fn decode_command(command: Command, encoding: ContentEncoding) -> Result<Command, SandboxError> {
    if encoding == ContentEncoding::Utf8 {
        return Ok(command);
    }
    Ok(match command {
        Command::ExecuteCode { code, language } => Command::ExecuteCode {
            code: decode_base64("code", &code)?,
            language,
        },
        Command::WriteFile { path, content } => Command::WriteFile {
            path,
            content: decode_base64("content", &content)?,
        },
        other => other,
    })
}

fn decode_base64(field: &str, raw: &str) -> Result<String, SandboxError> {
    let bytes = BASE64.decode(raw.trim()).map_err(|e| SandboxError::ValidationFailed {
        rule: "invalid_encoding".into(),
        reason: format!("{} is not valid base64: {}", field, e),
    })?;
    String::from_utf8(bytes).map_err(|_| SandboxError::ValidationFailed {
        rule: "invalid_encoding".into(),
        reason: format!("{} is not valid UTF-8", field),
    })
}
