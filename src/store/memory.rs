//! Single-process session store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{SessionStore, StoreLock};
use crate::config::LockPolicy;
use crate::error::{Result, SandboxError};
use crate::session::Session;

/// Concurrent map of sessions.
///
/// With [`LockPolicy::ProcessWide`] every lock key shares one semaphore, so all
/// create and close operations in the process are serialized. That is only
/// correct with a single manager per store.
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    policy: LockPolicy,
    global_lock: Arc<Semaphore>,
    key_locks: DashMap<String, Arc<Semaphore>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(LockPolicy::default())
    }
}

impl MemorySessionStore {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            policy,
            global_lock: Arc::new(Semaphore::new(1)),
            key_locks: DashMap::new(),
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn semaphore_for(&self, key: &str) -> Arc<Semaphore> {
        match self.policy {
            LockPolicy::ProcessWide => Arc::clone(&self.global_lock),
            LockPolicy::PerKey => Arc::clone(
                &self
                    .key_locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            ),
        }
    }

    /// Drop per-key semaphores nobody holds or waits on.
    fn prune_key_locks(&self) {
        if self.policy == LockPolicy::PerKey {
            self.key_locks.retain(|_, sem| Arc::strong_count(sem) > 1);
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.sessions.remove(id).is_some();
        self.prune_key_locks();
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.contains_key(id))
    }

    async fn update_activity(&self, id: &str) -> Result<bool> {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.touch(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration) -> Result<Option<StoreLock>> {
        let semaphore = self.semaphore_for(key);
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Some(StoreLock::local(key, permit))),
            Ok(Err(_)) => Err(SandboxError::Store("lock semaphore closed".into())),
            Err(_) => Ok(None),
        }
    }
}
