//! Per-session fixed-window execution limiter.
//!
//! Windows reset lazily: the first check after a window has elapsed starts a
//! new one. No timers, no I/O.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub window_start: Instant,
    pub execution_count: u32,
    pub max_executions: u32,
    pub total_executions: u64,
}

impl RateLimitState {
    fn new(now: Instant, max_executions: u32) -> Self {
        Self {
            window_start: now,
            execution_count: 0,
            max_executions,
            total_executions: 0,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.execution_count = 0;
        }
    }

    fn remaining(&self) -> u32 {
        self.max_executions.saturating_sub(self.execution_count)
    }

    fn retry_after(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.duration_since(self.window_start))
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Whole seconds until the window resets, rounded up. Zero when allowed.
    pub retry_after_secs: u64,
}

/// Read-only quota view for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub execution_count: u32,
    pub max_executions: u32,
    pub remaining: u32,
    pub total_executions: u64,
    pub resets_in_secs: u64,
}

#[derive(Default)]
pub struct RateLimiter {
    states: DashMap<String, RateLimitState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the quota for `session_id` and consume one execution if allowed.
    pub fn try_acquire(
        &self,
        session_id: &str,
        max_executions: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let now = Instant::now();
        let mut state = self
            .states
            .entry(session_id.to_string())
            .or_insert_with(|| RateLimitState::new(now, max_executions));
        state.max_executions = max_executions;
        state.roll_window(now, window);

        if state.execution_count < state.max_executions {
            state.execution_count += 1;
            state.total_executions += 1;
            RateLimitDecision {
                allowed: true,
                remaining: state.remaining(),
                retry_after_secs: 0,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: ceil_secs(state.retry_after(now, window)),
            }
        }
    }

    pub fn status(&self, session_id: &str, window: Duration) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let state = self.states.get(session_id)?;
        let expired = now.duration_since(state.window_start) >= window;
        let execution_count = if expired { 0 } else { state.execution_count };
        Some(RateLimitStatus {
            execution_count,
            max_executions: state.max_executions,
            remaining: state.max_executions.saturating_sub(execution_count),
            total_executions: state.total_executions,
            resets_in_secs: if expired {
                0
            } else {
                ceil_secs(state.retry_after(now, window))
            },
        })
    }

    /// Forget a session, e.g. once it is closed.
    pub fn remove(&self, session_id: &str) {
        self.states.remove(session_id);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.states.len()
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_first_n_allowed_then_denied() {
        let limiter = RateLimiter::new();
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.try_acquire("s1", 3, WINDOW);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.try_acquire("s1", 3, WINDOW);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_lazily() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.try_acquire("s1", 3, WINDOW);
        }
        tokio::time::advance(Duration::from_millis(59_500)).await;
        let denied = limiter.try_acquire("s1", 3, WINDOW);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let allowed = limiter.try_acquire("s1", 3, WINDOW);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 2);

        let status = limiter.status("s1", WINDOW).unwrap();
        assert_eq!(status.execution_count, 1);
        assert_eq!(status.total_executions, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.try_acquire("a", 1, WINDOW).allowed);
        assert!(!limiter.try_acquire("a", 1, WINDOW).allowed);
        assert!(limiter.try_acquire("b", 1, WINDOW).allowed);
        assert_eq!(limiter.tracked_sessions(), 2);

        limiter.remove("a");
        assert!(limiter.status("a", WINDOW).is_none());
        assert!(limiter.try_acquire("a", 1, WINDOW).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_expired_window_as_fresh() {
        let limiter = RateLimiter::new();
        limiter.try_acquire("s1", 5, WINDOW);
        limiter.try_acquire("s1", 5, WINDOW);
        let status = limiter.status("s1", WINDOW).unwrap();
        assert_eq!(status.remaining, 3);
        assert_eq!(status.resets_in_secs, 60);

        tokio::time::advance(WINDOW).await;
        let status = limiter.status("s1", WINDOW).unwrap();
        assert_eq!(status.execution_count, 0);
        assert_eq!(status.remaining, 5);
        assert_eq!(status.total_executions, 2);
    }
}
