//! Session lifecycle: create, execute, close, expire.
//!
//! The manager owns every live environment it created, wrapped in a
//! [`SecureEnvironment`]. The store only ever sees the serializable
//! [`Session`] record. Create and close run under a store lock keyed by
//! session id with a bounded wait.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ExecutionPolicy, ManagerConfig, SessionConfig};
use crate::error::{Result, SandboxError};
use crate::runtime::{
    Command, CommandResult, ExecutionBackend, ExecutionEnvironment, ResourceUsage, RuntimeSelector,
};
use crate::security::{
    AuditEntry, AuditEventType, AuditLog, RateLimitStatus, RateLimiter, SecureEnvironment,
};
use crate::store::{SessionStore, StoreLock};

use super::{Session, SessionState};

/// The live half of a session held by the instance that created it.
struct LiveSession {
    environment: SecureEnvironment,
    config: SessionConfig,
    /// Serializes read-modify-write of this session's store record.
    record: tokio::sync::Mutex<()>,
    /// Held for the whole command under [`ExecutionPolicy::Serialized`].
    exec_gate: tokio::sync::Mutex<()>,
}

/// Bounded memory of recently closed ids.
struct ClosedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl ClosedIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: &str) {
        if self.capacity == 0 || !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Requested,
    Expired,
    Shutdown,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub marked_idle: Vec<String>,
    pub orphans_released: Vec<String>,
    pub failed: Vec<String>,
}

pub struct SessionManager {
    selector: Arc<RuntimeSelector>,
    store: Arc<dyn SessionStore>,
    config: ManagerConfig,
    instance_id: String,
    live: DashMap<String, Arc<LiveSession>>,
    closed: Mutex<ClosedIds>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
}

impl SessionManager {
    pub fn new(
        selector: Arc<RuntimeSelector>,
        store: Arc<dyn SessionStore>,
        config: ManagerConfig,
    ) -> Self {
        let instance_id = format!("isolate-{}", Uuid::new_v4().simple());
        info!(instance_id = %instance_id, "Session manager started");
        Self {
            selector,
            store,
            closed: Mutex::new(ClosedIds::new(config.closed_tombstone_capacity)),
            audit: Arc::new(AuditLog::new(config.audit_capacity)),
            rate_limiter: Arc::new(RateLimiter::new()),
            config,
            instance_id,
            live: DashMap::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn selector(&self) -> &RuntimeSelector {
        &self.selector
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Sessions whose environment lives in this instance.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn rate_limit_status(&self, id: &str) -> Option<RateLimitStatus> {
        let live = self.live.get(id)?;
        self.rate_limiter
            .status(id, live.config.security.rate_limit_window())
    }

    pub async fn create_session(
        &self,
        config: SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        config.validate()?;
        let backend = self.resolve_backend(&config, cancel).await?;

        let id = Uuid::new_v4().to_string();
        let lock = self.lock(&id).await?;

        let environment = match backend.create_environment(&id, &config, cancel).await {
            Ok(env) => env,
            Err(SandboxError::Cancelled) => {
                release(lock).await;
                return Err(SandboxError::Cancelled);
            }
            Err(e) => {
                release(lock).await;
                warn!(backend = backend.name(), error = %e, "Environment creation failed");
                return Err(SandboxError::RuntimeUnavailable(format!(
                    "{} could not create an environment: {}",
                    backend.name(),
                    e
                )));
            }
        };

        let mut session = Session::new(
            &id,
            environment.runtime_type(),
            environment.id(),
            config.clone(),
            &self.instance_id,
        );
        session.transition(SessionState::Active);

        let environment = SecureEnvironment::new(
            environment,
            &id,
            &config.security,
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.audit),
        )?
        .with_user(config.user_id.clone());

        if let Err(e) = self.store.save(&session).await {
            warn!(session_id = %id, error = %e, "Persisting new session failed, releasing environment");
            if let Err(cleanup) = environment.cleanup().await {
                warn!(session_id = %id, error = %cleanup, "Environment cleanup failed");
            }
            release(lock).await;
            return Err(e);
        }

        self.live.insert(
            id.clone(),
            Arc::new(LiveSession {
                environment,
                config,
                record: tokio::sync::Mutex::new(()),
                exec_gate: tokio::sync::Mutex::new(()),
            }),
        );
        release(lock).await;

        self.audit.record(
            AuditEntry::new(&id, AuditEventType::SessionCreated, "session created")
                .with_user(session.config.user_id.clone())
                .with_metadata("backend", backend.name())
                .with_metadata("runtime_type", session.runtime_type.to_string())
                .with_metadata("language", session.language.clone()),
        );
        info!(
            session_id = %id,
            backend = backend.name(),
            environment_id = %session.environment_id,
            "Created session"
        );
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.store.get(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list().await
    }

    /// Run `command` through the session's security pipeline.
    ///
    /// Rate-limit and validation rejections come back as a failed
    /// [`CommandResult`]. Backend faults are folded into a failed result too;
    /// the session stays open.
    pub async fn execute_in_session(
        &self,
        id: &str,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let live = self.live_session(id).await?;
        match self.store.get(id).await? {
            Some(record) if record.state.is_terminal() => {
                return Err(SandboxError::SessionClosed(id.to_string()))
            }
            Some(_) => {}
            None => return Err(self.missing(id)),
        }

        let _gate = match self.config.execution_policy {
            ExecutionPolicy::Serialized => Some(live.exec_gate.lock().await),
            ExecutionPolicy::Concurrent => None,
        };

        let result = match live.environment.execute(command, cancel).await {
            Ok(result) => result,
            Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(e @ SandboxError::EnvironmentStopped(_)) => {
                if self.is_closed(id) || !self.is_open(id).await? {
                    return Err(SandboxError::SessionClosed(id.to_string()));
                }
                warn!(session_id = %id, error = %e, "Environment stopped under an open session");
                CommandResult::failure(e.to_string())
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Backend execution failed");
                CommandResult::failure(e.to_string())
            }
        };

        if !result.is_rejected() {
            self.record_execution(id, &live).await?;
        }
        debug!(
            session_id = %id,
            kind = %command.kind(),
            success = result.success,
            rejected = result.is_rejected(),
            "Executed command"
        );
        Ok(result)
    }

    /// Keepalive: bump `last_activity` without running anything.
    pub async fn touch_session(&self, id: &str) -> Result<Session> {
        let live = self.live_session(id).await?;
        let _record = live.record.lock().await;
        match self.store.get(id).await? {
            Some(record) if record.state.is_terminal() => {
                Err(SandboxError::SessionClosed(id.to_string()))
            }
            Some(_) => {
                self.store.update_activity(id).await?;
                self.store
                    .get(id)
                    .await?
                    .ok_or_else(|| self.missing(id))
            }
            None => Err(self.missing(id)),
        }
    }

    /// Close a session and release its environment. Closing an absent or
    /// already closed session is a no-op.
    pub async fn close_session(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.close_with_reason(id, CloseReason::Requested, cancel)
            .await
            .map(|_| ())
    }

    pub async fn get_session_resource_usage(&self, id: &str) -> Result<Option<ResourceUsage>> {
        let live = self.live_session(id).await?;
        Ok(live.environment.resource_usage().await)
    }

    /// Close expired sessions owned by this instance and mark quiet ones idle.
    pub async fn cleanup_expired_sessions(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let sessions = self.store.list().await?;
        let now = Utc::now();
        let idle_after = self.config.idle_after();

        let stored: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        let orphans: Vec<String> = self
            .live
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !stored.contains(id.as_str()))
            .collect();

        for session in sessions.iter().filter(|s| s.owner == self.instance_id) {
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            if session.is_expired(now) {
                match self
                    .close_with_reason(&session.id, CloseReason::Expired, cancel)
                    .await
                {
                    Ok(true) => report.expired.push(session.id.clone()),
                    Ok(false) => {}
                    Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "Failed to close expired session");
                        report.failed.push(session.id.clone());
                    }
                }
            } else if session.state == SessionState::Active && session.idle_for(now) > idle_after {
                if self.mark_idle(&session.id, now).await? {
                    report.marked_idle.push(session.id.clone());
                }
            }
        }

        for id in orphans {
            // the record expired out of a shared store before we swept it
            if self.release_orphan(&id).await {
                report.orphans_released.push(id);
            }
        }

        if !report.expired.is_empty() || !report.orphans_released.is_empty() {
            info!(
                expired = report.expired.len(),
                orphans = report.orphans_released.len(),
                idle = report.marked_idle.len(),
                "Swept sessions"
            );
        }
        Ok(report)
    }

    /// Close every session whose environment lives here. Returns how many closed.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        let cancel = CancellationToken::new();
        let mut closed = 0;
        for id in ids {
            match self.close_with_reason(&id, CloseReason::Shutdown, &cancel).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Failed to close session on shutdown"),
            }
        }
        info!(closed, "Session manager shut down");
        closed
    }

    async fn resolve_backend(
        &self,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionBackend>> {
        match config.runtime_type {
            Some(runtime_type) => {
                self.selector
                    .select_by_type(runtime_type, &config.language, cancel)
                    .await
            }
            None => {
                self.selector
                    .select_best(&config.language, config.runtime_preference, cancel)
                    .await
            }
        }
    }

    async fn lock(&self, id: &str) -> Result<StoreLock> {
        let key = format!("session:{id}");
        let timeout = self.config.lock_timeout();
        self.store
            .acquire_lock(&key, timeout)
            .await?
            .ok_or(SandboxError::LockTimeout {
                key,
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Returns true if this call closed the session.
    async fn close_with_reason(
        &self,
        id: &str,
        reason: CloseReason,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let lock = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            lock = self.lock(id) => lock?,
        };
        let record = self.store.get(id).await?;
        let live = self.live.get(id).map(|e| Arc::clone(e.value()));

        let live = match (live, record) {
            (Some(live), _) => live,
            (None, Some(record)) if record.owner != self.instance_id => {
                release(lock).await;
                return Err(SandboxError::SessionNotLocal(id.to_string()));
            }
            (None, Some(_)) => {
                // our own record without a handle: nothing left to release
                self.store.remove(id).await?;
                self.remember_closed(id);
                release(lock).await;
                return Ok(false);
            }
            (None, None) => {
                release(lock).await;
                return Ok(false);
            }
        };

        let guard = live.record.lock().await;
        let mut record = match self.store.get(id).await? {
            Some(record) => record,
            None => {
                drop(guard);
                self.live.remove(id);
                self.remember_closed(id);
                if let Err(e) = live.environment.cleanup().await {
                    warn!(session_id = %id, error = %e, "Environment cleanup failed");
                }
                release(lock).await;
                return Ok(false);
            }
        };
        // Cancellation is honoured up to here. Release below is not raced.
        if cancel.is_cancelled() {
            drop(guard);
            release(lock).await;
            return Err(SandboxError::Cancelled);
        }
        if record.state != SessionState::Closing {
            record.transition(SessionState::Closing);
            self.store.save(&record).await?;
        }
        drop(guard);

        let cleanup = live.environment.cleanup().await;

        let mut entry = match reason {
            CloseReason::Expired => {
                AuditEntry::new(id, AuditEventType::SessionExpired, "session expired")
            }
            CloseReason::Requested => {
                AuditEntry::new(id, AuditEventType::SessionClosed, "session closed")
            }
            CloseReason::Shutdown => {
                AuditEntry::new(id, AuditEventType::SessionClosed, "session closed on shutdown")
            }
        }
        .with_user(record.config.user_id.clone())
        .with_metadata("execution_count", record.execution_count);
        if let Err(e) = cleanup {
            warn!(session_id = %id, error = %e, "Environment cleanup failed");
            entry = entry.failed(e.to_string());
        }

        record.transition(SessionState::Closed);
        self.remember_closed(id);
        self.live.remove(id);
        self.store.remove(id).await?;
        release(lock).await;

        self.audit.record(entry);
        info!(session_id = %id, ?reason, "Closed session");
        Ok(true)
    }

    async fn record_execution(&self, id: &str, live: &LiveSession) -> Result<()> {
        let _record = live.record.lock().await;
        match self.store.get(id).await? {
            Some(mut record) if !record.state.is_terminal() => {
                record.record_execution(Utc::now());
                self.store.save(&record).await
            }
            _ => Ok(()),
        }
    }

    async fn mark_idle(&self, id: &str, now: chrono::DateTime<Utc>) -> Result<bool> {
        let Some(live) = self.live.get(id).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };
        let _record = live.record.lock().await;
        match self.store.get(id).await? {
            Some(mut record)
                if record.state == SessionState::Active
                    && record.idle_for(now) > self.config.idle_after() =>
            {
                record.transition(SessionState::Idle);
                self.store.save(&record).await?;
                debug!(session_id = %id, "Marked session idle");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_orphan(&self, id: &str) -> bool {
        let Ok(lock) = self.lock(id).await else {
            return false;
        };
        let released = match self.store.exists(id).await {
            Ok(false) => match self.live.remove(id) {
                Some((_, live)) => {
                    if let Err(e) = live.environment.cleanup().await {
                        warn!(session_id = %id, error = %e, "Orphan cleanup failed");
                    }
                    self.remember_closed(id);
                    self.audit.record(AuditEntry::new(
                        id,
                        AuditEventType::SessionExpired,
                        "session record expired from store",
                    ));
                    true
                }
                None => false,
            },
            _ => false,
        };
        release(lock).await;
        released
    }

    async fn live_session(&self, id: &str) -> Result<Arc<LiveSession>> {
        if let Some(live) = self.live.get(id) {
            return Ok(Arc::clone(live.value()));
        }
        if self.is_closed(id) {
            return Err(SandboxError::SessionClosed(id.to_string()));
        }
        match self.store.get(id).await? {
            Some(record) if record.state.is_terminal() => {
                Err(SandboxError::SessionClosed(id.to_string()))
            }
            Some(_) => Err(SandboxError::SessionNotLocal(id.to_string())),
            None => Err(SandboxError::SessionNotFound(id.to_string())),
        }
    }

    async fn is_open(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(id)
            .await?
            .is_some_and(|record| !record.state.is_terminal()))
    }

    fn missing(&self, id: &str) -> SandboxError {
        if self.is_closed(id) {
            SandboxError::SessionClosed(id.to_string())
        } else {
            SandboxError::SessionNotFound(id.to_string())
        }
    }

    fn is_closed(&self, id: &str) -> bool {
        self.closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    fn remember_closed(&self, id: &str) {
        self.closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
    }
}

async fn release(lock: StoreLock) {
    let key = lock.key().to_string();
    match lock.release().await {
        Ok(true) => {}
        Ok(false) => warn!(key = %key, "Lock expired before release"),
        Err(e) => warn!(key = %key, error = %e, "Failed to release lock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_ids_are_bounded() {
        let mut closed = ClosedIds::new(2);
        closed.insert("a");
        closed.insert("b");
        closed.insert("b");
        closed.insert("c");
        assert!(!closed.contains("a"));
        assert!(closed.contains("b"));
        assert!(closed.contains("c"));
        assert_eq!(closed.order.len(), 2);
    }

    #[test]
    fn test_zero_capacity_remembers_nothing() {
        let mut closed = ClosedIds::new(0);
        closed.insert("a");
        assert!(!closed.contains("a"));
    }
}
