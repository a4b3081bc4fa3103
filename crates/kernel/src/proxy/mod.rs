//! Proxy reconciler — renders a deterministic nginx configuration from
//! the route/certificate set and applies it atomically:
//! validate → backup → swap → reload, with rollback on any failure.

mod reconciler;
mod render;

pub use reconciler::{
    NginxProcess, NoopProcess, ProxyProcess, ProxyReconciler, ProxyStatus, ReconcileOutcome,
};
pub use render::{config_hash, render_config};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Rendered config failed the proxy's validator; the active config is
    /// untouched.
    #[error("proxy config validation failed: {0}")]
    Invalid(String),
    #[error("proxy reload failed: {0}")]
    Reload(String),
    /// Rollback also failed; serving continues on the last-known-good
    /// config but operator attention is required.
    #[error("proxy degraded: {0}")]
    Degraded(String),
    #[error("proxy config io: {0}")]
    Io(#[from] std::io::Error),
}
