//! Process-wide admission control and shutdown coordination.
//!
//! The supervisor owns the lockdown flag and the root cancellation token.
//! Lockdown is initialized at process start, never lazily on first read.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct Lockdown {
    pub reason: String,
    pub actor: String,
    pub since: DateTime<Utc>,
}

pub struct Supervisor {
    /// Readers vastly outnumber writers: every mutating operation checks
    /// the flag, only admin lockdown/lift writes it.
    lockdown: RwLock<Option<Lockdown>>,
    started_at: DateTime<Utc>,
    restart_requested_at: RwLock<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            lockdown: RwLock::new(None),
            started_at: Utc::now(),
            restart_requested_at: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reject the operation if the process is locked down.
    pub fn check_writable(&self) -> Result<()> {
        match self.lockdown.read().as_ref() {
            Some(lockdown) => Err(Error::LockedDown(lockdown.reason.clone())),
            None => Ok(()),
        }
    }

    pub fn lockdown(&self, reason: impl Into<String>, actor: impl Into<String>) -> Lockdown {
        let lockdown = Lockdown {
            reason: reason.into(),
            actor: actor.into(),
            since: Utc::now(),
        };
        tracing::warn!(reason = %lockdown.reason, actor = %lockdown.actor, "entering lockdown");
        *self.lockdown.write() = Some(lockdown.clone());
        lockdown
    }

    /// Returns the lockdown that was lifted, if any.
    pub fn lift_lockdown(&self) -> Option<Lockdown> {
        let lifted = self.lockdown.write().take();
        if let Some(ref lockdown) = lifted {
            tracing::warn!(since = %lockdown.since, "lockdown lifted");
        }
        lifted
    }

    pub fn current_lockdown(&self) -> Option<Lockdown> {
        self.lockdown.read().clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// Timestamp an emergency-restart request. The actual exec/restart is
    /// the init system's job; we record intent and begin teardown.
    pub fn mark_restart_requested(&self) -> DateTime<Utc> {
        let now = Utc::now();
        *self.restart_requested_at.write() = Some(now);
        now
    }

    pub fn restart_requested_at(&self) -> Option<DateTime<Utc>> {
        *self.restart_requested_at.read()
    }

    /// Root token: background tasks subscribe via child tokens so a single
    /// cancel fans out to the whole process.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn begin_shutdown(&self) {
        tracing::info!("shutdown initiated");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
