//! Per-command security: rate limiting, validation, sanitization and audit.

pub mod audit;
pub mod pipeline;
pub mod rate_limiter;
pub mod validator;

pub use audit::{AuditEntry, AuditEventType, AuditLog, AuditSeverity};
pub use pipeline::SecureEnvironment;
pub use rate_limiter::{RateLimitDecision, RateLimitStatus, RateLimiter};
pub use validator::{InputValidator, ValidationError, ValidationRule};
