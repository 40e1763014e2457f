//! Security decorator over an execution environment.
//!
//! Every command goes through rate limiting, input validation, delegation,
//! output sanitization and auditing, in that order. Each step gates the next.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::Result;
use crate::runtime::{
    Command, CommandResult, EnvironmentState, ExecutionEnvironment, Rejection, ResourceUsage,
    RuntimeType,
};

use super::audit::{AuditEntry, AuditEventType, AuditLog, AuditSeverity};
use super::rate_limiter::RateLimiter;
use super::validator::{InputValidator, ValidationError};

pub struct SecureEnvironment {
    inner: Box<dyn ExecutionEnvironment>,
    session_id: String,
    user_id: Option<String>,
    rate_limiting: bool,
    input_validation: bool,
    audit_logging: bool,
    max_executions: u32,
    window: Duration,
    validator: InputValidator,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
}

impl SecureEnvironment {
    /// Wrap `inner`. Fails if the configured patterns do not compile.
    pub fn new(
        inner: Box<dyn ExecutionEnvironment>,
        session_id: impl Into<String>,
        config: &SecurityConfig,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        Ok(Self {
            validator: InputValidator::new(config)?,
            inner,
            session_id: session_id.into(),
            user_id: None,
            rate_limiting: config.enable_rate_limiting,
            input_validation: config.enable_input_validation,
            audit_logging: config.enable_audit_logging,
            max_executions: config.max_executions_per_window,
            window: config.rate_limit_window(),
            rate_limiter,
            audit,
        })
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn record(&self, entry: AuditEntry) {
        if self.audit_logging {
            self.audit.record(entry.with_user(self.user_id.clone()));
        }
    }

    fn check_rate_limit(&self, command: &Command) -> Option<CommandResult> {
        if !self.rate_limiting {
            return None;
        }
        let decision = self
            .rate_limiter
            .try_acquire(&self.session_id, self.max_executions, self.window);
        if decision.allowed {
            return None;
        }

        warn!(
            session_id = %self.session_id,
            retry_after_secs = decision.retry_after_secs,
            "Rate limit exceeded"
        );
        self.record(
            AuditEntry::new(
                &self.session_id,
                AuditEventType::RateLimitExceeded,
                format!("rate limit exceeded: {}", command.summary()),
            )
            .with_severity(AuditSeverity::Warning)
            .failed("rate limit exceeded")
            .with_metadata("retry_after_secs", decision.retry_after_secs)
            .with_metadata("max_executions", self.max_executions),
        );
        Some(CommandResult::rejected(Rejection::RateLimited {
            retry_after_secs: decision.retry_after_secs,
            remaining: decision.remaining,
        }))
    }

    fn check_input(&self, command: &Command) -> Option<CommandResult> {
        if !self.input_validation {
            return None;
        }
        let ValidationError { rule, message } =
            match self.validator.validate(command, self.inner.workspace_root()) {
                Ok(()) => return None,
                Err(e) => e,
            };

        warn!(session_id = %self.session_id, %rule, %message, "Command rejected");
        let (event_type, severity) = if rule.is_security_violation() {
            (AuditEventType::SecurityViolation, AuditSeverity::Error)
        } else {
            (AuditEventType::InputValidationFailure, AuditSeverity::Warning)
        };
        self.record(
            AuditEntry::new(
                &self.session_id,
                event_type,
                format!("rejected {}", command.summary()),
            )
            .with_severity(severity)
            .failed(message.clone())
            .with_metadata("rule", rule.as_str())
            .with_metadata("command_kind", command.kind().to_string()),
        );
        Some(CommandResult::rejected(Rejection::ValidationFailed {
            rule: rule.as_str().to_string(),
            message,
        }))
    }

    fn audit_outcome(&self, command: &Command, outcome: &Result<CommandResult>, elapsed_ms: u64) {
        let entry = AuditEntry::new(
            &self.session_id,
            AuditEventType::for_command(command.kind()),
            command.summary(),
        )
        .with_duration_ms(elapsed_ms)
        .with_metadata("environment_id", self.inner.id());

        let entry = match outcome {
            Ok(result) if result.success => entry,
            Ok(result) => entry.failed(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit code {:?}", result.exit_code)),
            ),
            Err(e) => entry.with_severity(AuditSeverity::Error).failed(e.to_string()),
        };
        self.record(entry);
    }
}

#[async_trait]
impl ExecutionEnvironment for SecureEnvironment {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn runtime_type(&self) -> RuntimeType {
        self.inner.runtime_type()
    }

    fn state(&self) -> EnvironmentState {
        self.inner.state()
    }

    fn workspace_root(&self) -> &Path {
        self.inner.workspace_root()
    }

    async fn execute(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        if let Some(rejected) = self.check_rate_limit(command) {
            return Ok(rejected);
        }
        if let Some(rejected) = self.check_input(command) {
            return Ok(rejected);
        }

        let started = Instant::now();
        let outcome = self.inner.execute(command, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match outcome {
            Ok(result) if self.input_validation => Ok(self.validator.sanitize_output(result)),
            other => other,
        };
        debug!(
            session_id = %self.session_id,
            kind = %command.kind(),
            elapsed_ms,
            ok = outcome.is_ok(),
            "Command delegated"
        );
        self.audit_outcome(command, &outcome, elapsed_ms);
        outcome
    }

    async fn resource_usage(&self) -> Option<ResourceUsage> {
        self.inner.resource_usage().await
    }

    async fn cleanup(&self) -> Result<()> {
        self.rate_limiter.remove(&self.session_id);
        self.inner.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::runtime::EnvironmentStateMachine;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEnvironment {
        root: PathBuf,
        state: EnvironmentStateMachine,
        calls: Arc<AtomicUsize>,
        stdout: String,
        fail: bool,
    }

    impl FakeEnvironment {
        fn new(calls: Arc<AtomicUsize>) -> Self {
            let state = EnvironmentStateMachine::new("fake-1");
            state.mark_ready();
            Self {
                root: PathBuf::from("/workspace"),
                state,
                calls,
                stdout: "ok".to_string(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ExecutionEnvironment for FakeEnvironment {
        fn id(&self) -> &str {
            "fake-1"
        }

        fn runtime_type(&self) -> RuntimeType {
            RuntimeType::PermissionedProcess
        }

        fn state(&self) -> EnvironmentState {
            self.state.current()
        }

        fn workspace_root(&self) -> &Path {
            &self.root
        }

        async fn execute(&self, _: &Command, _: &CancellationToken) -> Result<CommandResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SandboxError::BackendExecutionFailed("boom".into()));
            }
            Ok(CommandResult::success(self.stdout.clone()))
        }

        async fn cleanup(&self) -> Result<()> {
            if self.state.begin_stop() {
                self.state.finish_stop();
            }
            Ok(())
        }
    }

    fn wrap(
        inner: FakeEnvironment,
        config: &SecurityConfig,
    ) -> (SecureEnvironment, Arc<RateLimiter>, Arc<AuditLog>) {
        let limiter = Arc::new(RateLimiter::new());
        let audit = Arc::new(AuditLog::new(100));
        let env = SecureEnvironment::new(
            Box::new(inner),
            "s1",
            config,
            Arc::clone(&limiter),
            Arc::clone(&audit),
        )
        .unwrap();
        (env, limiter, audit)
    }

    fn code(src: &str) -> Command {
        Command::ExecuteCode {
            code: src.to_string(),
            language: None,
        }
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_without_delegating() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = SecurityConfig {
            max_executions_per_window: 2,
            ..Default::default()
        };
        let (env, _, audit) = wrap(FakeEnvironment::new(Arc::clone(&calls)), &config);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            assert!(env.execute(&code("print(1)"), &cancel).await.unwrap().success);
        }
        let third = env.execute(&code("print(1)"), &cancel).await.unwrap();
        assert!(!third.success);
        match third.rejection {
            Some(Rejection::RateLimited { remaining, retry_after_secs }) => {
                assert_eq!(remaining, 0);
                assert!(retry_after_secs > 0);
            }
            other => panic!("unexpected rejection: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(audit.by_event_type(AuditEventType::RateLimitExceeded, 10).len(), 1);
        assert_eq!(audit.by_event_type(AuditEventType::CodeExecution, 10).len(), 2);
    }

    #[tokio::test]
    async fn test_traversal_is_rejected_and_audited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (env, _, audit) = wrap(
            FakeEnvironment::new(Arc::clone(&calls)),
            &SecurityConfig::default(),
        );
        let write = Command::WriteFile {
            path: "../../etc/passwd".into(),
            content: "root::0:0".into(),
        };
        let result = env.execute(&write, &CancellationToken::new()).await.unwrap();

        assert!(!result.success);
        match result.rejection {
            Some(Rejection::ValidationFailed { rule, .. }) => assert_eq!(rule, "path_traversal"),
            other => panic!("unexpected rejection: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let violations = audit.by_event_type(AuditEventType::SecurityViolation, 10);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].metadata["rule"], "path_traversal");
    }

    #[tokio::test]
    async fn test_empty_code_is_input_failure_not_violation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (env, _, audit) = wrap(
            FakeEnvironment::new(Arc::clone(&calls)),
            &SecurityConfig::default(),
        );
        let result = env.execute(&code("   "), &CancellationToken::new()).await.unwrap();
        assert!(result.is_rejected());
        assert_eq!(audit.by_event_type(AuditEventType::InputValidationFailure, 10).len(), 1);
        assert!(audit.by_event_type(AuditEventType::SecurityViolation, 10).is_empty());
    }

    #[tokio::test]
    async fn test_output_is_sanitized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inner = FakeEnvironment::new(calls);
        inner.stdout = "x".repeat(50);
        let config = SecurityConfig {
            max_output_length: 10,
            ..Default::default()
        };
        let (env, _, _) = wrap(inner, &config);

        let result = env.execute(&code("print('x' * 50)"), &CancellationToken::new()).await.unwrap();
        assert!(result.stdout.starts_with("xxxxxxxxxx\n"));
        assert!(result.stdout.contains("original length 50"));
        assert_eq!(result.metadata["output_truncated"], true);
    }

    #[tokio::test]
    async fn test_disabled_checks_pass_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inner = FakeEnvironment::new(Arc::clone(&calls));
        inner.stdout = "x".repeat(50);
        let config = SecurityConfig {
            enable_rate_limiting: false,
            enable_input_validation: false,
            enable_audit_logging: false,
            max_executions_per_window: 0,
            max_output_length: 10,
            ..Default::default()
        };
        let (env, _, audit) = wrap(inner, &config);

        let result = env.execute(&code("rm -rf /"), &CancellationToken::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.len(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_is_audited_and_propagated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inner = FakeEnvironment::new(calls);
        inner.fail = true;
        let (env, _, audit) = wrap(inner, &SecurityConfig::default());

        let err = env
            .execute(&code("print(1)"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendExecutionFailed(_)));
        let entries = audit.by_event_type(AuditEventType::CodeExecution, 10);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert_eq!(entries[0].severity, AuditSeverity::Error);
    }

    #[tokio::test]
    async fn test_cleanup_forgets_rate_limit_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (env, limiter, _) = wrap(FakeEnvironment::new(calls), &SecurityConfig::default());
        env.execute(&code("print(1)"), &CancellationToken::new()).await.unwrap();
        assert_eq!(limiter.tracked_sessions(), 1);

        env.cleanup().await.unwrap();
        assert_eq!(limiter.tracked_sessions(), 0);
        assert_eq!(env.state(), EnvironmentState::Stopped);
    }
}
