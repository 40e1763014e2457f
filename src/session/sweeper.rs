//! Periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::SessionManager;

/// Run [`SessionManager::cleanup_expired_sessions`] every `period` until
/// `cancel` fires.
pub fn spawn_sweeper(
    manager: Arc<SessionManager>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = manager.cleanup_expired_sessions(&cancel).await {
                if cancel.is_cancelled() {
                    break;
                }
                warn!(error = %e, "Session sweep failed");
            }
        }
        info!("Session sweeper stopped");
    })
}
