//! In-memory engine used by state-machine and reconciler tests.
//!
//! Deterministic: containers are plain map entries, events are emitted by
//! the test through [`FakeEngine::emit`], and failures are injected per
//! call site.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{
    ContainerEngine, ContainerState, ContainerSummary, CreateSpec, EngineError, EngineEvent,
    EventAction, LogLine, StatsSample, LABEL_MANAGED, LABEL_PROJECT_ID, LABEL_SERVICE_ID,
    MANAGED_VALUE,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub service_id: i64,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Default)]
struct Failures {
    pull: Option<EngineError>,
    start: Option<EngineError>,
    stop: Option<EngineError>,
}

pub struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    networks: Mutex<Vec<String>>,
    /// `(network, container_id, aliases)` per connect call.
    connections: Mutex<Vec<(String, String, Vec<String>)>>,
    failures: Mutex<Failures>,
    next_id: AtomicU64,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    /// Optional artificial latency for start/stop, to widen race windows
    /// in coalescing tests.
    op_delay: Mutex<Option<Duration>>,
    events: broadcast::Sender<EngineEvent>,
    log_lines: Mutex<Vec<LogLine>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        FakeEngine {
            containers: Mutex::new(HashMap::new()),
            networks: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            failures: Mutex::new(Failures::default()),
            next_id: AtomicU64::new(1),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            op_delay: Mutex::new(None),
            events,
            log_lines: Mutex::new(Vec::new()),
        }
    }

    // ── Test controls ───────────────────────────────────────────

    pub fn fail_next_pull(&self, err: EngineError) {
        self.failures.lock().pull = Some(err);
    }

    pub fn fail_next_start(&self, err: EngineError) {
        self.failures.lock().start = Some(err);
    }

    pub fn fail_next_stop(&self, err: EngineError) {
        self.failures.lock().stop = Some(err);
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock() = Some(delay);
    }

    /// Sleep out the configured delay, bailing on cancellation.
    async fn delay(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let delay = *self.op_delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.containers.lock().get(id).cloned()
    }

    pub fn container_for_service(&self, service_id: i64) -> Option<FakeContainer> {
        self.containers
            .lock()
            .values()
            .find(|c| c.service_id == service_id)
            .cloned()
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().clone()
    }

    pub fn connections(&self) -> Vec<(String, String, Vec<String>)> {
        self.connections.lock().clone()
    }

    pub fn push_log_line(&self, line: LogLine) {
        self.log_lines.lock().push(line);
    }

    /// Emit an engine event, also updating the fake's own state for `die`.
    pub fn emit(&self, container_id: &str, action: EventAction, exit_code: Option<i64>) {
        if action == EventAction::Die {
            if let Some(c) = self.containers.lock().get_mut(container_id) {
                c.running = false;
                c.exit_code = exit_code;
            }
        }
        let service_id = self
            .containers
            .lock()
            .get(container_id)
            .map(|c| c.service_id);
        let _ = self.events.send(EngineEvent {
            container_id: container_id.to_string(),
            service_id,
            action,
            exit_code,
            at: Utc::now(),
        });
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn pull_image(&self, _image: &str, _cancel: &CancellationToken) -> Result<(), EngineError> {
        if let Some(err) = self.failures.lock().pull.take() {
            return Err(err);
        }
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &CreateSpec,
        _cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        if let Some(existing) = self.container_for_service(spec.service_id) {
            return Ok(existing.id);
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.container_name.clone(),
                service_id: spec.service_id,
                running: false,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.delay(cancel).await?;
        if let Some(err) = self.failures.lock().start.take() {
            return Err(err);
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        match self.containers.lock().get_mut(container_id) {
            Some(c) => {
                c.running = true;
                c.exit_code = None;
                Ok(())
            }
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _grace_secs: u32,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.delay(cancel).await?;
        if let Some(err) = self.failures.lock().stop.take() {
            return Err(err);
        }
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        match self.containers.lock().get_mut(container_id) {
            Some(c) => {
                c.running = false;
                c.exit_code = Some(0);
                Ok(())
            }
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn remove_container(
        &self,
        container_id: &str,
        _force: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        match self.containers.lock().remove(container_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        let containers = self.containers.lock();
        let c = containers
            .get(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
        labels.insert(LABEL_SERVICE_ID.to_string(), c.service_id.to_string());
        labels.insert(LABEL_PROJECT_ID.to_string(), "1".to_string());
        Ok(ContainerState {
            id: c.id.clone(),
            status: if c.running { "running" } else { "exited" }.to_string(),
            running: c.running,
            exit_code: c.exit_code,
            started_at: c.running.then(Utc::now),
            // Loopback stands in for a container network address so probe
            // tests can run a real listener.
            ip_address: c.running.then(|| "127.0.0.1".to_string()),
            labels,
        })
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .containers
            .lock()
            .values()
            .map(|c| {
                let mut labels = HashMap::new();
                labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
                labels.insert(LABEL_SERVICE_ID.to_string(), c.service_id.to_string());
                ContainerSummary {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    image: "fake:latest".to_string(),
                    state: if c.running { "running" } else { "exited" }.to_string(),
                    labels,
                }
            })
            .collect())
    }

    async fn list_unmanaged(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(vec![])
    }

    async fn ensure_network(&self, name: &str, _project_id: i64) -> Result<(), EngineError> {
        let mut networks = self.networks.lock();
        if !networks.iter().any(|n| n == name) {
            networks.push(name.to_string());
        }
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<(), EngineError> {
        self.connections.lock().push((
            network.to_string(),
            container_id.to_string(),
            aliases.to_vec(),
        ));
        Ok(())
    }

    fn event_stream(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
        let rx = self.events.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok().map(Ok) });
        Box::pin(stream)
    }

    async fn log_tail(&self, _container_id: &str, tail: u32) -> Result<Vec<LogLine>, EngineError> {
        let lines = self.log_lines.lock();
        let take = (tail as usize).min(lines.len());
        Ok(lines[lines.len() - take..].to_vec())
    }

    fn log_stream(
        &self,
        _container_id: &str,
        _follow: bool,
    ) -> BoxStream<'static, Result<LogLine, EngineError>> {
        let lines = self.log_lines.lock().clone();
        Box::pin(futures_util::stream::iter(lines.into_iter().map(Ok)))
    }

    fn stats_stream(
        &self,
        _container_id: &str,
    ) -> BoxStream<'static, Result<StatsSample, EngineError>> {
        Box::pin(futures_util::stream::empty())
    }
}
