//! Docker engine client — core struct, constructor, error classification.
//!
//! Domain methods live in sibling modules which add `impl DockerEngine`
//! blocks; the [`super::ContainerEngine`] trait impl here delegates to
//! them.

use async_trait::async_trait;
use bollard::Docker;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    ContainerEngine, ContainerState, ContainerSummary, CreateSpec, EngineEvent, LogLine,
    StatsSample,
};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure; retriable with backoff.
    #[error("engine unreachable: {0}")]
    Unreachable(String),
    /// Surfaced to the caller, never retried by the adapter.
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("host port conflict: {0}")]
    PortConflict(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("engine error: {0}")]
    Engine(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unreachable(_))
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match err {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            B::DockerResponseServerError { message, .. } if is_port_conflict(&message) => {
                EngineError::PortConflict(message)
            }
            B::IOError { err } => EngineError::Unreachable(err.to_string()),
            B::HyperResponseError { err } => EngineError::Unreachable(err.to_string()),
            B::RequestTimeoutError => EngineError::Unreachable("request timed out".into()),
            other => EngineError::Engine(other.to_string()),
        }
    }
}

fn is_port_conflict(message: &str) -> bool {
    message.contains("port is already allocated") || message.contains("address already in use")
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    /// `pub(super)` so that domain modules in sibling files can call
    /// bollard APIs directly.
    pub(super) client: Docker,
}

impl DockerEngine {
    pub fn connect(socket_path: &str) -> Result<Self, EngineError> {
        let client = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| EngineError::Unreachable(e.to_string()))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| EngineError::Unreachable(e.to_string()))?
        };
        Ok(DockerEngine { client })
    }

    /// Race a bollard call against a cancellation signal; cancellation
    /// propagates within one I/O round-trip.
    pub(super) async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T, bollard::errors::Error>>,
    ) -> Result<T, EngineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = fut => result.map_err(EngineError::from),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.client.ping().await.map_err(EngineError::from)?;
        Ok(())
    }

    async fn pull_image(&self, image: &str, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.pull(image, cancel).await
    }

    async fn create_container(
        &self,
        spec: &CreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.create(spec, cancel).await
    }

    async fn start_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.start(container_id, cancel).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace_secs: u32,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.stop(container_id, grace_secs, cancel).await
    }

    async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.remove(container_id, force, cancel).await
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        self.inspect(container_id).await
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        self.list_by_label(true).await
    }

    async fn list_unmanaged(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        self.list_by_label(false).await
    }

    async fn ensure_network(&self, name: &str, project_id: i64) -> Result<(), EngineError> {
        self.ensure_bridge_network(name, project_id).await
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<(), EngineError> {
        self.connect_with_aliases(network, container_id, aliases)
            .await
    }

    fn event_stream(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
        self.managed_event_stream()
    }

    async fn log_tail(&self, container_id: &str, tail: u32) -> Result<Vec<LogLine>, EngineError> {
        self.tail_logs(container_id, tail).await
    }

    fn log_stream(
        &self,
        container_id: &str,
        follow: bool,
    ) -> BoxStream<'static, Result<LogLine, EngineError>> {
        self.follow_logs(container_id, follow)
    }

    fn stats_stream(
        &self,
        container_id: &str,
    ) -> BoxStream<'static, Result<StatsSample, EngineError>> {
        self.follow_stats(container_id)
    }
}
