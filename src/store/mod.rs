//! Session persistence.
//!
//! Two interchangeable variants sit behind [`SessionStore`]: an in-process
//! map ([`MemorySessionStore`]) and a record-per-key store over any
//! [`KeyValueStore`] offering set-if-absent and compare-and-delete
//! ([`SharedSessionStore`]). A deployment picks one at startup.

pub mod kv;
pub mod memory;
pub mod shared;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use crate::error::Result;
use crate::session::Session;

pub use kv::{KeyValueStore, MemoryKeyValueStore};
pub use memory::MemorySessionStore;
pub use shared::SharedSessionStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Returns whether a record was removed.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Session>>;

    async fn exists(&self, id: &str) -> Result<bool>;

    /// Set `last_activity` to now and wake an idle session. Returns false if
    /// the session is not stored.
    async fn update_activity(&self, id: &str) -> Result<bool>;

    /// Acquire the lock named `key`, waiting at most `timeout`. `None` means
    /// the lock could not be acquired in time.
    async fn acquire_lock(&self, key: &str, timeout: Duration) -> Result<Option<StoreLock>>;
}

enum LockGuard {
    Local(OwnedSemaphorePermit),
    Shared {
        kv: Arc<dyn KeyValueStore>,
        token: String,
    },
}

/// A held store lock. Release explicitly with [`StoreLock::release`]; a lock
/// that is dropped instead is released in the background.
pub struct StoreLock {
    key: String,
    guard: Option<LockGuard>,
}

impl StoreLock {
    pub(crate) fn local(key: impl Into<String>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            key: key.into(),
            guard: Some(LockGuard::Local(permit)),
        }
    }

    pub(crate) fn shared(key: impl Into<String>, kv: Arc<dyn KeyValueStore>, token: String) -> Self {
        Self {
            key: key.into(),
            guard: Some(LockGuard::Shared { kv, token }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. For a shared lock this only deletes the key if it
    /// still holds our token; returns false when the lock had already expired
    /// and was taken by someone else.
    pub async fn release(mut self) -> Result<bool> {
        match self.guard.take() {
            Some(LockGuard::Local(permit)) => {
                drop(permit);
                Ok(true)
            }
            Some(LockGuard::Shared { kv, token }) => kv.delete_if_equals(&self.key, &token).await,
            None => Ok(false),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(LockGuard::Shared { kv, token }) = self.guard.take() {
            let key = std::mem::take(&mut self.key);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = kv.delete_if_equals(&key, &token).await {
                            warn!(key = %key, error = %e, "Failed to release dropped lock");
                        }
                    });
                }
                Err(_) => warn!(key = %key, "Dropped lock outside a runtime, left to expire"),
            }
        }
    }
}
