//! Execution backends and the environments they create.
//!
//! A backend is one isolation technology (a container engine, a permissioned
//! subprocess, ...). It reports static capability facts, checks availability
//! and creates [`ExecutionEnvironment`]s, each of which is one live sandbox
//! bound to exactly one session.

pub mod command;
pub mod container;
pub mod exec;
pub mod process;
pub mod selector;
pub mod state;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::Result;

pub use command::{Command, CommandKind, CommandResult, Rejection, ResourceUsage};
pub use selector::{RuntimeSelector, RuntimeStatus};
pub use state::{EnvironmentState, EnvironmentStateMachine};

/// Isolation technology of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    Container,
    PermissionedProcess,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Container => f.write_str("container"),
            RuntimeType::PermissionedProcess => f.write_str("permissioned_process"),
        }
    }
}

/// Objective used when scoring candidate backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPreference {
    Speed,
    Security,
    Memory,
    #[default]
    Balanced,
}

/// Static capability facts about one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub startup_time_ms: u64,
    pub memory_overhead_mb: u64,
    /// Relative strength, 0..=10. Only used for scoring.
    pub isolation_level: u8,
    pub supports_filesystem_persistence: bool,
    pub supports_network_access: bool,
    pub max_concurrent_executions: u32,
}

impl RuntimeDescriptor {
    /// Score for the given preference. Higher is better.
    pub fn score(&self, preference: SelectionPreference) -> f64 {
        let speed = 10_000.0 / self.startup_time_ms.max(1) as f64;
        let security = f64::from(self.isolation_level.min(10)) * 10.0;
        let memory = 1_000.0 / self.memory_overhead_mb.max(1) as f64;
        match preference {
            SelectionPreference::Speed => speed,
            SelectionPreference::Security => security,
            SelectionPreference::Memory => memory,
            SelectionPreference::Balanced => 0.4 * speed + 0.3 * security + 0.3 * memory,
        }
    }
}

/// One isolation technology.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn runtime_type(&self) -> RuntimeType;

    /// Languages this backend can run, lowercase.
    fn supported_environments(&self) -> &[String];

    fn supports(&self, language: &str) -> bool {
        self.supported_environments()
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }

    /// Check whether the backend can create environments right now. May be slow.
    async fn is_available(&self, cancel: &CancellationToken) -> bool;

    async fn create_environment(
        &self,
        session_id: &str,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ExecutionEnvironment>>;

    fn capabilities(&self) -> RuntimeDescriptor;
}

/// One live sandbox.
///
/// Implementations take `&self` so that several commands may run against the
/// same environment concurrently; backends that cannot do that serialize
/// internally.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn id(&self) -> &str;

    fn runtime_type(&self) -> RuntimeType;

    fn state(&self) -> EnvironmentState;

    /// Root directory that file commands are confined to, as seen by the sandbox.
    fn workspace_root(&self) -> &Path;

    async fn execute(&self, command: &Command, cancel: &CancellationToken)
        -> Result<CommandResult>;

    /// Best-effort usage snapshot; `None` when the backend cannot report it.
    async fn resource_usage(&self) -> Option<ResourceUsage> {
        None
    }

    /// Release every resource held by the environment. Idempotent.
    async fn cleanup(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(startup: u64, memory: u64, isolation: u8) -> RuntimeDescriptor {
        RuntimeDescriptor {
            startup_time_ms: startup,
            memory_overhead_mb: memory,
            isolation_level: isolation,
            supports_filesystem_persistence: true,
            supports_network_access: false,
            max_concurrent_executions: 1,
        }
    }

    #[test]
    fn test_speed_prefers_fast_startup() {
        let fast = descriptor(50, 100, 2);
        let slow = descriptor(2000, 100, 9);
        assert_eq!(fast.score(SelectionPreference::Speed), 200.0);
        assert_eq!(slow.score(SelectionPreference::Speed), 5.0);
        assert!(slow.score(SelectionPreference::Security) > fast.score(SelectionPreference::Security));
    }

    #[test]
    fn test_balanced_formula() {
        let d = descriptor(100, 10, 5);
        // 0.4 * 100 + 0.3 * 50 + 0.3 * 100
        let expected = 40.0 + 15.0 + 30.0;
        assert!((d.score(SelectionPreference::Balanced) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_zero_costs_do_not_divide_by_zero() {
        let d = descriptor(0, 0, 10);
        assert!(d.score(SelectionPreference::Speed).is_finite());
        assert!(d.score(SelectionPreference::Memory).is_finite());
    }
}
