//! Shared application state.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Cancelled on shutdown; request handlers derive child tokens from it.
    pub shutdown: CancellationToken,
    /// Operator template that client create requests are applied to.
    pub session_defaults: Arc<SessionConfig>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self::with_shutdown(manager, CancellationToken::new())
    }

    pub fn with_shutdown(manager: Arc<SessionManager>, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            shutdown,
            session_defaults: Arc::new(SessionConfig::default()),
        }
    }

    pub fn with_session_defaults(mut self, defaults: SessionConfig) -> Self {
        self.session_defaults = Arc::new(defaults);
        self
    }

    /// Token for one request. Dropping the request does not cancel it.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
