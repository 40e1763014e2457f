//! Session store over a shared key-value backend.
//!
//! Each session is one JSON record whose expiry is the shorter of its idle
//! timeout and max lifetime, refreshed on every write. Locks are tokens stored
//! with set-if-absent and released with a token-checked delete, so a holder
//! whose lock expired can never release a lock someone else has since taken.

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::kv::KeyValueStore;
use super::{SessionStore, StoreLock};
use crate::error::Result;
use crate::session::Session;

const DEFAULT_PREFIX: &str = "isolate";
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
const MIN_RECORD_TTL: Duration = Duration::from_secs(1);

pub struct SharedSessionStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    lock_ttl: Duration,
}

impl SharedSessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            prefix: DEFAULT_PREFIX.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Namespace for every key written by this store.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// How long an unreleased lock survives its holder.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn session_prefix(&self) -> String {
        format!("{}:session:", self.prefix)
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}:session:{}", self.prefix, id)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    async fn load(&self, key: &str) -> Result<Option<Session>> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// Record expiry: `min(idle timeout, max lifetime)`, at least one second.
pub fn record_ttl(session: &Session) -> Duration {
    let minutes = session
        .config
        .idle_timeout_minutes
        .min(session.config.max_lifetime_minutes);
    Duration::from_secs(u64::from(minutes) * 60).max(MIN_RECORD_TTL)
}

fn lock_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[async_trait]
impl SessionStore for SharedSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.kv
            .set(&self.session_key(&session.id), &raw, Some(record_ttl(session)))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.load(&self.session_key(id)).await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.kv.delete(&self.session_key(id)).await
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let keys = self.kv.keys_with_prefix(&self.session_prefix()).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            // a key may expire between listing and loading
            match self.load(&key).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable session record"),
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.kv.get(&self.session_key(id)).await?.is_some())
    }

    async fn update_activity(&self, id: &str) -> Result<bool> {
        match self.get(id).await? {
            Some(mut session) => {
                session.touch(Utc::now());
                self.save(&session).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration) -> Result<Option<StoreLock>> {
        let lock_key = self.lock_key(key);
        let token = lock_token();
        let deadline = Instant::now() + timeout;

        loop {
            if self.kv.set_if_absent(&lock_key, &token, self.lock_ttl).await? {
                debug!(key = %lock_key, "Acquired shared lock");
                return Ok(Some(StoreLock::shared(lock_key, Arc::clone(&self.kv), token)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
