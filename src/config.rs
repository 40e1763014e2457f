//! Session, security, manager and service configuration.
//!
//! Every struct accepts partial JSON: missing fields fall back to defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::runtime::{RuntimeType, SelectionPreference};

/// Per-session configuration. Snapshotted at creation and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub language: String,
    pub runtime_preference: Option<SelectionPreference>,
    /// Forces a backend type and bypasses scoring.
    pub runtime_type: Option<RuntimeType>,
    pub idle_timeout_minutes: u32,
    pub max_lifetime_minutes: u32,
    pub persist_filesystem: bool,
    pub resource_limits: ResourceLimits,
    pub security: SecurityConfig,
    /// Caller identity stamped on audit entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: "python".to_string(),
            runtime_preference: None,
            runtime_type: None,
            idle_timeout_minutes: 30,
            max_lifetime_minutes: 120,
            persist_filesystem: false,
            resource_limits: ResourceLimits::default(),
            security: SecurityConfig::default(),
            user_id: None,
        }
    }
}

impl SessionConfig {
    pub fn for_language(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            ..Default::default()
        }
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.idle_timeout_minutes))
    }

    pub fn max_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.max_lifetime_minutes))
    }

    pub fn validate(&self) -> Result<()> {
        if self.language.trim().is_empty() {
            return Err(SandboxError::InvalidConfig("language must not be empty".into()));
        }
        self.security.validate()
    }
}

/// Limits applied to processes inside a sandbox. Enforcement precision is
/// backend dependent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_time_ms: u64,
    pub max_processes: u64,
    pub max_file_size_kb: u64,
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_time_ms: 30_000,
            max_processes: 64,
            max_file_size_kb: 10_240,
            max_open_files: 256,
        }
    }
}

pub const DEFAULT_BLOCKED_CODE_PATTERNS: &[&str] = &[
    r#"rm\s+-[a-zA-Z]*[rf][a-zA-Z]*\s+(/|~)(?:[\s'"*;)]|$)"#,
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\bsudo\b",
    r"\bsu\s+-",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\s+if=.*\bof=/dev/",
    r"chmod\s+(-R\s+)?[0-7]*777\s+/",
    r">\s*/dev/sd[a-z]",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r"(curl|wget)\s+[^|]*\|\s*(ba|z)?sh\b",
    r"os\.fork\(\)\s*while|while\s+True:\s*os\.fork",
];

pub const DEFAULT_BLOCKED_PATH_PATTERNS: &[&str] = &[
    r"^/etc/(passwd|shadow|sudoers)",
    r"(^|/)\.ssh(/|$)",
    r"^/proc(/|$)",
    r"^/sys(/|$)",
    r"^/dev(/|$)",
    r"^/root(/|$)",
];

/// Security pipeline settings for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_rate_limiting: bool,
    pub enable_input_validation: bool,
    pub enable_audit_logging: bool,
    pub max_executions_per_window: u32,
    pub rate_limit_window_secs: u64,
    pub max_code_length: usize,
    pub max_output_length: usize,
    /// Require file paths to stay inside the session workspace.
    pub sandbox_filesystem: bool,
    pub allow_shell_commands: bool,
    pub max_package_name_length: usize,
    /// Regular expressions matched against code and shell command lines.
    pub blocked_code_patterns: Vec<String>,
    /// Regular expressions matched against canonical file paths.
    pub blocked_path_patterns: Vec<String>,
    /// Allowed file extensions without the dot. Empty allows any extension.
    pub allowed_extensions: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_rate_limiting: true,
            enable_input_validation: true,
            enable_audit_logging: true,
            max_executions_per_window: 60,
            rate_limit_window_secs: 60,
            max_code_length: 100_000,
            max_output_length: 1_048_576,
            sandbox_filesystem: true,
            allow_shell_commands: true,
            max_package_name_length: 214,
            blocked_code_patterns: DEFAULT_BLOCKED_CODE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            blocked_path_patterns: DEFAULT_BLOCKED_PATH_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            allowed_extensions: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enable_rate_limiting && self.rate_limit_window_secs == 0 {
            return Err(SandboxError::InvalidConfig(
                "rate_limit_window_secs must be positive".into(),
            ));
        }
        for pattern in self
            .blocked_code_patterns
            .iter()
            .chain(self.blocked_path_patterns.iter())
        {
            regex::Regex::new(pattern).map_err(|e| {
                SandboxError::InvalidConfig(format!("invalid blocked pattern {:?}: {}", pattern, e))
            })?;
        }
        if self.max_output_length == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_output_length must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Whether concurrent commands on one session may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Commands go straight to the environment; the backend decides.
    #[default]
    Concurrent,
    /// One command at a time per session.
    Serialized,
}

/// Locking granularity of the in-memory session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// A single semaphore shared by every key.
    #[default]
    ProcessWide,
    /// One semaphore per key.
    PerKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub lock_timeout_ms: u64,
    /// Sessions without activity for this long are marked idle by the sweep.
    pub idle_after_secs: u64,
    pub closed_tombstone_capacity: usize,
    pub execution_policy: ExecutionPolicy,
    pub availability_cache_ttl_ms: u64,
    pub audit_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            idle_after_secs: 300,
            closed_tombstone_capacity: 10_000,
            execution_policy: ExecutionPolicy::Concurrent,
            availability_cache_ttl_ms: 5_000,
            audit_capacity: crate::security::audit::DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl ManagerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_after_secs as i64)
    }

    pub fn availability_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.availability_cache_ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Keyvalue,
}

/// Top-level configuration of the `isolate` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub port: u16,
    pub store: StoreKind,
    pub lock_policy: LockPolicy,
    pub sweep_interval_secs: u64,
    pub workspace_base: PathBuf,
    pub container_binary: String,
    /// Container image per language.
    pub container_images: HashMap<String, String>,
    /// Namespace for keys in the shared key-value store.
    pub key_prefix: String,
    pub lock_ttl_secs: u64,
    pub manager: ManagerConfig,
    /// Template for sessions created over HTTP. Security settings and
    /// resource limits come only from here.
    pub session_defaults: SessionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let container_images = [
            ("python", "python:3.12-slim"),
            ("javascript", "node:20-slim"),
            ("bash", "debian:bookworm-slim"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            port: 8080,
            store: StoreKind::Memory,
            lock_policy: LockPolicy::ProcessWide,
            sweep_interval_secs: 60,
            workspace_base: std::env::temp_dir(),
            container_binary: "docker".to_string(),
            container_images,
            key_prefix: "isolate".to_string(),
            lock_ttl_secs: 30,
            manager: ManagerConfig::default(),
            session_defaults: SessionConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServiceConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.idle_timeout_minutes, 30);
        assert_eq!(config.max_lifetime_minutes, 120);
        assert!(config.security.enable_rate_limiting);
        assert!(config.security.allowed_extensions.is_empty());
        assert!(!config.security.blocked_code_patterns.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"language":"javascript","runtime_preference":"speed","security":{"max_executions_per_window":3}}"#,
        )
        .unwrap();
        assert_eq!(config.language, "javascript");
        assert_eq!(config.runtime_preference, Some(SelectionPreference::Speed));
        assert_eq!(config.security.max_executions_per_window, 3);
        assert_eq!(config.security.rate_limit_window_secs, 60);
        assert_eq!(config.idle_timeout_minutes, 30);
    }

    #[test]
    fn test_validate_rejects_empty_language() {
        let config = SessionConfig::for_language("  ");
        assert!(matches!(config.validate(), Err(SandboxError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = SessionConfig::default();
        config.security.blocked_code_patterns.push("(unclosed".into());
        assert!(matches!(config.validate(), Err(SandboxError::InvalidConfig(_))));
    }

    #[test]
    fn test_service_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isolate.json");
        std::fs::write(
            &path,
            r#"{"port":9090,"store":"keyvalue","lock_policy":"per_key","manager":{"execution_policy":"serialized"},"session_defaults":{"security":{"allow_shell_commands":false}}}"#,
        )
        .unwrap();

        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.store, StoreKind::Keyvalue);
        assert_eq!(config.lock_policy, LockPolicy::PerKey);
        assert_eq!(config.manager.execution_policy, ExecutionPolicy::Serialized);
        assert_eq!(config.manager.lock_timeout_ms, 10_000);
        assert_eq!(config.container_binary, "docker");
        assert_eq!(config.key_prefix, "isolate");
        assert!(!config.session_defaults.security.allow_shell_commands);
        assert!(config.session_defaults.security.enable_input_validation);
    }
}
