//! Sessions: the orchestration-level handle for one client's sandbox.

pub mod manager;
pub mod sweeper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SessionConfig;
use crate::runtime::RuntimeType;

pub use manager::SessionManager;
pub use sweeper::spawn_sweeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Creating,
    Active,
    Idle,
    Closing,
    Closed,
}

impl SessionState {
    /// `Creating -> Active <-> Idle -> Closing -> Closed`.
    ///
    /// `Closing -> Active` and `Closing -> Idle` are allowed so an interrupted
    /// close can put the session back the way it was.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Active, Idle)
                | (Idle, Active)
                | (Active, Closing)
                | (Idle, Closing)
                | (Closing, Active)
                | (Closing, Idle)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Creating => "creating",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Serializable projection of a session. Never holds the environment handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub runtime_type: RuntimeType,
    pub environment_id: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub execution_count: u64,
    pub config: SessionConfig,
    /// Instance id of the manager holding the live environment.
    pub owner: String,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        runtime_type: RuntimeType,
        environment_id: impl Into<String>,
        config: SessionConfig,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            runtime_type,
            environment_id: environment_id.into(),
            language: config.language.clone(),
            created_at: now,
            last_activity: now,
            state: SessionState::Creating,
            execution_count: 0,
            config,
            owner: owner.into(),
        }
    }

    /// True when idle longer than the idle timeout or alive longer than the
    /// max lifetime. Both comparisons are strict.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity > self.config.idle_timeout()
            || now - self.created_at > self.config.max_lifetime()
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Account one accepted command.
    pub fn record_execution(&mut self, now: DateTime<Utc>) {
        self.execution_count += 1;
        self.touch(now);
    }

    /// Bump activity without counting a command. Wakes an idle session.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
        if self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}
