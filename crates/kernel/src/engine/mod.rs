//! Engine adapter — the sole point of contact with the container engine.
//!
//! [`ContainerEngine`] is the seam the state machine, prober, and
//! networking consume; [`DockerEngine`] implements it over bollard, with
//! domain methods split across sibling modules (`container`, `image`,
//! `network`, `events`, `logs`, `stats`) that add `impl DockerEngine`
//! blocks.
//!
//! The adapter never retries state-changing calls on its own; retry
//! policy belongs to the state machine.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

mod client;
pub mod container;
pub mod events;
pub mod image;
pub mod logs;
pub mod network;
pub mod stats;

#[cfg(test)]
pub mod fake;

pub use client::{DockerEngine, EngineError};
pub use events::{EngineEvent, EventAction};
pub use logs::{LogLine, LogSource};
pub use stats::StatsSample;

/// Label marking containers this process owns. Containers without it are
/// never mutated, only enumerated for discovery and adoption.
pub const LABEL_MANAGED: &str = "managed_by";
pub const MANAGED_VALUE: &str = "glinr";
pub const LABEL_SERVICE_ID: &str = "glinr.service_id";
pub const LABEL_PROJECT_ID: &str = "glinr.project_id";

/// Everything the engine needs to materialize a service's container.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub service_id: i64,
    pub project_id: i64,
    /// Deterministic container name; create is idempotent across retries.
    pub container_name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<crate::store::PortMap>,
    pub volumes: Vec<crate::store::VolumeMap>,
    /// Aliases the container answers to once attached to its project
    /// network (attachment happens after create).
    pub aliases: Vec<String>,
    /// `on-failure` retry budget; exhaustion is what the crash-loop
    /// detector latches on.
    pub restart_max_retries: u32,
}

/// Observed container state from inspect.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub id: String,
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    /// The container's own network address (project network preferred),
    /// absent until the container is attached and running.
    pub ip_address: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerState {
    pub fn is_managed(&self) -> bool {
        self.labels.get(LABEL_MANAGED).map(String::as_str) == Some(MANAGED_VALUE)
    }

    pub fn service_id(&self) -> Option<i64> {
        self.labels.get(LABEL_SERVICE_ID)?.parse().ok()
    }
}

/// Summary row for list/discovery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn pull_image(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Returns the container id. Idempotent: a name collision with a
    /// container carrying the same service label resolves to that
    /// container.
    async fn create_container(
        &self,
        spec: &CreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;

    async fn start_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// SIGTERM, wait `grace_secs`, then SIGKILL.
    async fn stop_container(
        &self,
        container_id: &str,
        grace_secs: u32,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerState, EngineError>;

    /// Containers carrying the managed label.
    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Containers without the managed label, for the adoption flow.
    async fn list_unmanaged(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn ensure_network(&self, name: &str, project_id: i64) -> Result<(), EngineError>;

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<(), EngineError>;

    /// Lifecycle events for managed containers. Infinite; ends only on
    /// transport loss (the pump reconnects).
    fn event_stream(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>>;

    async fn log_tail(&self, container_id: &str, tail: u32) -> Result<Vec<LogLine>, EngineError>;

    fn log_stream(
        &self,
        container_id: &str,
        follow: bool,
    ) -> BoxStream<'static, Result<LogLine, EngineError>>;

    fn stats_stream(&self, container_id: &str)
        -> BoxStream<'static, Result<StatsSample, EngineError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_label_detection() {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
        labels.insert(LABEL_SERVICE_ID.to_string(), "7".to_string());
        let state = ContainerState {
            id: "abc".into(),
            status: "running".into(),
            running: true,
            exit_code: None,
            started_at: None,
            ip_address: Some("172.18.0.5".into()),
            labels,
        };
        assert!(state.is_managed());
        assert_eq!(state.service_id(), Some(7));
    }

    #[test]
    fn unmanaged_container_has_no_service() {
        let state = ContainerState {
            id: "abc".into(),
            status: "running".into(),
            running: true,
            exit_code: None,
            started_at: None,
            ip_address: None,
            labels: HashMap::new(),
        };
        assert!(!state.is_managed());
        assert_eq!(state.service_id(), None);
    }
}
