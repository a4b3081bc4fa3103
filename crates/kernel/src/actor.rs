//! Request actor — the explicit value carried into every kernel entry point.
//!
//! Never a thread-local: handlers build an [`Actor`] from the verified
//! token and pass it down so concurrency audits stay mechanical.

use serde::{Deserialize, Serialize};

/// Role attached to an API token. Ordering encodes privilege:
/// `Viewer < Deployer < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Deployer,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "deployer" => Some(Role::Deployer),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Deployer => "deployer",
            Role::Viewer => "viewer",
        }
    }
}

/// The authenticated caller of a kernel operation.
#[derive(Debug, Clone)]
pub struct Actor {
    /// Token name the caller authenticated with.
    pub name: String,
    pub role: Role,
    /// Shared across every mutation performed for one request, so cascades
    /// show up in the audit log as a single logical operation.
    pub correlation_id: String,
}

impl Actor {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Internal actor for kernel-originated mutations (reconciler ticks,
    /// renewal jobs, bootstrap).
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }

    pub fn can(&self, required: Role) -> bool {
        self.role >= required
    }
}
