//! Service state machine — per-service lifecycle FSM and the
//! desired-vs-actual reconciliation that drives the container engine.

pub mod crashloop;
mod machine;

pub use crashloop::{observe_die, CrashPolicy, CrashVerdict};
pub use machine::{Command, LifecycleManager};

use serde::Serialize;

/// FSM states. `Stopped` and `Exited` differ only in provenance:
/// `Stopped` is user-requested, `Exited` is engine-reported termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Exited,
    CrashLooping,
    Removing,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Exited => "exited",
            ServiceState::CrashLooping => "crash_looping",
            ServiceState::Removing => "removing",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
