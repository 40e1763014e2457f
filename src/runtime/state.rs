//! Backend-agnostic environment state machine.
//!
//! `Initializing -> Ready -> Running <-> Idle -> Stopped`, with `Error`
//! reachable from `Running` when a command faults. `Error` is sticky until the
//! owner cleans up, but further commands may still be attempted.
//!
//! Release is two-phase: [`EnvironmentStateMachine::begin_stop`] refuses new
//! commands, and only [`EnvironmentStateMachine::finish_stop`] enters `Stopped`
//! once the backend resources are actually gone. A release that failed or was
//! interrupted can therefore be retried.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Initializing,
    Ready,
    Running,
    Idle,
    Error,
    Stopped,
}

#[derive(Debug)]
struct Inner {
    state: EnvironmentState,
    in_flight: usize,
    stopping: bool,
}

/// Tracks the state of one environment under concurrent commands.
///
/// The state stays `Running` while any command is in flight and only moves to
/// `Idle` (or `Error`) once the last one finishes.
#[derive(Debug)]
pub struct EnvironmentStateMachine {
    id: String,
    inner: Mutex<Inner>,
}

impl EnvironmentStateMachine {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(Inner {
                state: EnvironmentState::Initializing,
                in_flight: 0,
                stopping: false,
            }),
        }
    }

    pub fn current(&self) -> EnvironmentState {
        self.lock().state
    }

    /// Initialization finished.
    pub fn mark_ready(&self) {
        let mut inner = self.lock();
        if inner.state == EnvironmentState::Initializing {
            inner.state = EnvironmentState::Ready;
        }
    }

    /// Enter `Running` for one command. Fails fast when stopped or stopping.
    pub fn begin_command(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.stopping {
            return Err(SandboxError::EnvironmentStopped(self.id.clone()));
        }
        match inner.state {
            EnvironmentState::Stopped => Err(SandboxError::EnvironmentStopped(self.id.clone())),
            EnvironmentState::Initializing => Err(SandboxError::BackendExecutionFailed(format!(
                "environment {} is still initializing",
                self.id
            ))),
            EnvironmentState::Error => {
                inner.in_flight += 1;
                Ok(())
            }
            _ => {
                inner.in_flight += 1;
                inner.state = EnvironmentState::Running;
                Ok(())
            }
        }
    }

    /// Leave `Running` for one command. A fault moves the environment to `Error`.
    pub fn finish_command(&self, faulted: bool) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        match inner.state {
            EnvironmentState::Stopped => {}
            _ if faulted => inner.state = EnvironmentState::Error,
            EnvironmentState::Running if inner.in_flight == 0 => {
                inner.state = EnvironmentState::Idle;
            }
            _ => {}
        }
    }

    /// Start releasing the environment; new commands fail from here on.
    /// Returns false if it is already stopped, in which case there is nothing
    /// left to release. May be called again after an interrupted release.
    pub fn begin_stop(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == EnvironmentState::Stopped {
            return false;
        }
        inner.stopping = true;
        true
    }

    /// The backend resources are gone.
    pub fn finish_stop(&self) {
        let mut inner = self.lock();
        inner.stopping = false;
        inner.state = EnvironmentState::Stopped;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
