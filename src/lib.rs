//! Isolate - session orchestration over pluggable sandbox backends.
//!
//! A [`RuntimeSelector`] picks a backend per session, the
//! [`SessionManager`] owns the resulting environments behind a
//! [`SecureEnvironment`] and tracks their lifecycle in a [`SessionStore`].

pub mod config;
pub mod error;
pub mod http_server;
pub mod runtime;
pub mod security;
pub mod session;
pub mod state;
pub mod store;

pub use config::{ManagerConfig, SecurityConfig, ServiceConfig, SessionConfig};
pub use error::{Result, SandboxError};
pub use runtime::{
    Command, CommandResult, ExecutionBackend, ExecutionEnvironment, RuntimeDescriptor,
    RuntimeSelector, RuntimeType, SelectionPreference,
};
pub use security::SecureEnvironment;
pub use session::{Session, SessionManager, SessionState};
pub use store::SessionStore;
