//! Error types for the orchestration layer.

use thiserror::Error;

/// Errors surfaced by session orchestration.
///
/// Rate-limit and validation rejections normally travel as a
/// [`Rejection`](crate::runtime::Rejection) inside a failed
/// [`CommandResult`](crate::runtime::CommandResult); the matching variants
/// here exist for callers that want to turn such a result into an error.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no runtime available: {0}")]
    RuntimeUnavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("session {0} is owned by another instance")]
    SessionNotLocal(String),

    #[error("timed out after {timeout_ms}ms acquiring lock {key}")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("validation failed ({rule}): {reason}")]
    ValidationFailed { rule: String, reason: String },

    #[error("rate limited: retry after {retry_after_secs}s ({remaining} remaining)")]
    RateLimited { retry_after_secs: u64, remaining: u32 },

    #[error("backend execution failed: {0}")]
    BackendExecutionFailed(String),

    #[error("environment {0} is stopped")]
    EnvironmentStopped(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("session store: {0}")]
    Store(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether the caller may safely retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::LockTimeout { .. }
                | SandboxError::Cancelled
                | SandboxError::RateLimited { .. }
                | SandboxError::Store(_)
        )
    }
}

impl From<regex::Error> for SandboxError {
    fn from(e: regex::Error) -> Self {
        Self::InvalidConfig(e.to_string())
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
