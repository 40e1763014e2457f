#![allow(dead_code)]

use async_trait::async_trait;
use isolate_orchestrator::config::ManagerConfig;
use isolate_orchestrator::runtime::{EnvironmentState, EnvironmentStateMachine, ResourceUsage};
use isolate_orchestrator::store::{MemorySessionStore, StoreLock};
use isolate_orchestrator::{
    Command, CommandResult, ExecutionBackend, ExecutionEnvironment, Result, RuntimeDescriptor,
    RuntimeSelector, RuntimeType, SandboxError, Session, SessionConfig, SessionManager,
    SessionStore,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counters shared between a fake backend and every environment it creates.
#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub executed: AtomicUsize,
    pub cleaned_up: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

pub struct FakeBackend {
    pub name: String,
    pub runtime_type: RuntimeType,
    pub languages: Vec<String>,
    pub descriptor: RuntimeDescriptor,
    pub available: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_execute: AtomicBool,
    pub exec_delay: Duration,
    pub cleanup_delay: Duration,
    pub counters: Arc<Counters>,
}

impl FakeBackend {
    pub fn new(name: &str, runtime_type: RuntimeType, startup_ms: u64, isolation: u8) -> Self {
        Self {
            name: name.to_string(),
            runtime_type,
            languages: vec!["python".to_string(), "javascript".to_string()],
            descriptor: RuntimeDescriptor {
                startup_time_ms: startup_ms,
                memory_overhead_mb: 32,
                isolation_level: isolation,
                supports_filesystem_persistence: true,
                supports_network_access: false,
                max_concurrent_executions: 4,
            },
            available: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            fail_execute: AtomicBool::new(false),
            exec_delay: Duration::ZERO,
            cleanup_delay: Duration::ZERO,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Slow, strongly isolated.
    pub fn container() -> Self {
        Self::new("fake-container", RuntimeType::Container, 2000, 9)
    }

    /// Fast, weakly isolated.
    pub fn process() -> Self {
        Self::new("fake-process", RuntimeType::PermissionedProcess, 50, 3)
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Release takes this long before it counts as done.
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn supported_environments(&self) -> &[String] {
        &self.languages
    }

    async fn is_available(&self, _cancel: &CancellationToken) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn create_environment(
        &self,
        session_id: &str,
        _config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ExecutionEnvironment>> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::BackendExecutionFailed("image pull failed".into()));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", self.name, session_id);
        let state = EnvironmentStateMachine::new(id.clone());
        state.mark_ready();
        Ok(Box::new(FakeEnvironment {
            root: PathBuf::from(format!("/sandbox/{session_id}")),
            id,
            runtime_type: self.runtime_type,
            state,
            fail: self.fail_execute.load(Ordering::SeqCst),
            delay: self.exec_delay,
            cleanup_delay: self.cleanup_delay,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn capabilities(&self) -> RuntimeDescriptor {
        self.descriptor
    }
}

pub struct FakeEnvironment {
    id: String,
    root: PathBuf,
    runtime_type: RuntimeType,
    state: EnvironmentStateMachine,
    fail: bool,
    delay: Duration,
    cleanup_delay: Duration,
    counters: Arc<Counters>,
}

#[async_trait]
impl ExecutionEnvironment for FakeEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn state(&self) -> EnvironmentState {
        self.state.current()
    }

    fn workspace_root(&self) -> &Path {
        &self.root
    }

    async fn execute(&self, command: &Command, _cancel: &CancellationToken) -> Result<CommandResult> {
        self.state.begin_command()?;
        self.counters.executed.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            self.state.finish_command(true);
            return Err(SandboxError::BackendExecutionFailed("interpreter crashed".into()));
        }
        self.state.finish_command(false);
        let stdout = match command {
            Command::ExecuteCode { code, .. } => code.clone(),
            other => other.summary(),
        };
        Ok(CommandResult::success(stdout))
    }

    async fn resource_usage(&self) -> Option<ResourceUsage> {
        Some(ResourceUsage {
            memory_bytes: Some(4096),
            process_count: Some(1),
            ..Default::default()
        })
    }

    async fn cleanup(&self) -> Result<()> {
        if !self.state.begin_stop() {
            return Ok(());
        }
        if !self.cleanup_delay.is_zero() {
            tokio::time::sleep(self.cleanup_delay).await;
        }
        self.counters.cleaned_up.fetch_add(1, Ordering::SeqCst);
        self.state.finish_stop();
        Ok(())
    }
}

/// Memory store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemorySessionStore,
    pub fail_save: AtomicBool,
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn save(&self, session: &Session) -> Result<()> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(SandboxError::Store("connection reset".into()));
        }
        self.inner.save(session).await
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.inner.remove(id).await
    }

    async fn list(&self) -> Result<Vec<Session>> {
        self.inner.list().await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        self.inner.exists(id).await
    }

    async fn update_activity(&self, id: &str) -> Result<bool> {
        self.inner.update_activity(id).await
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration) -> Result<Option<StoreLock>> {
        self.inner.acquire_lock(key, timeout).await
    }
}

pub fn memory_store() -> Arc<dyn SessionStore> {
    Arc::new(MemorySessionStore::default())
}

pub fn manager(backends: Vec<Arc<FakeBackend>>, config: ManagerConfig) -> Arc<SessionManager> {
    manager_with_store(backends, memory_store(), config)
}

pub fn manager_with_store(
    backends: Vec<Arc<FakeBackend>>,
    store: Arc<dyn SessionStore>,
    config: ManagerConfig,
) -> Arc<SessionManager> {
    let backends: Vec<Arc<dyn ExecutionBackend>> = backends
        .into_iter()
        .map(|b| b as Arc<dyn ExecutionBackend>)
        .collect();
    Arc::new(SessionManager::new(
        Arc::new(RuntimeSelector::new(backends)),
        store,
        config,
    ))
}

pub fn python() -> SessionConfig {
    SessionConfig::for_language("python")
}

pub fn code(src: &str) -> Command {
    Command::ExecuteCode {
        code: src.to_string(),
        language: None,
    }
}
