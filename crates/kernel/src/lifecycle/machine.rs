//! Per-service lifecycle actors and the manager that serializes them.
//!
//! One actor task per service is the serialization key: only one
//! lifecycle operation per service is in flight at a time. New commands
//! cancel the in-flight operation; queued commands coalesce so the latest
//! desired state wins. The queue is bounded; overflow is a `busy` error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::crashloop::{observe_die, CrashPolicy};
use super::ServiceState;
use crate::config::Config;
use crate::engine::{ContainerEngine, CreateSpec, EngineError, EngineEvent, EventAction};
use crate::error::{Error, Result};
use crate::events::{EventBus, StatusCache};
use crate::store::{DesiredState, HealthStatus, Service, Store};
use crate::supervisor::Supervisor;

/// Coalescing queue depth per service. Small by design: anything deeper
/// means the caller is racing itself.
const QUEUE_CAPACITY: usize = 4;

const RETRY_DELAYS_MS: [u64; 3] = [200, 800, 3200];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Unlock,
    Remove,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Restart => "restart",
            Command::Unlock => "unlock",
            Command::Remove => "remove",
        }
    }
}

struct Envelope {
    command: Command,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<ServiceState>>,
}

struct Handle {
    tx: mpsc::Sender<Envelope>,
    /// Token of the operation currently executing, fired when a newer
    /// command supersedes it.
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
}

pub struct LifecycleManager {
    store: Arc<Store>,
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<StatusCache>,
    bus: Arc<EventBus>,
    supervisor: Arc<Supervisor>,
    policy: CrashPolicy,
    stop_grace_secs: u32,
    pull_timeout: Duration,
    start_stop_timeout: Duration,
    actors: DashMap<i64, Handle>,
    engine_up: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<StatusCache>,
        bus: Arc<EventBus>,
        supervisor: Arc<Supervisor>,
        config: &Config,
        engine_up: watch::Receiver<bool>,
    ) -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager {
            store,
            engine,
            cache,
            bus,
            shutdown: supervisor.shutdown_token(),
            supervisor,
            policy: CrashPolicy::from_config(&config.crash_loop),
            stop_grace_secs: config.timeouts.container_stop_secs as u32,
            pull_timeout: Duration::from_secs(config.timeouts.image_pull_secs),
            start_stop_timeout: Duration::from_secs(config.timeouts.container_start_secs),
            actors: DashMap::new(),
            engine_up,
        })
    }

    /// The FSM state a service row presents right now.
    pub fn present_state(service: &Service) -> ServiceState {
        if service.crash_looping {
            return ServiceState::CrashLooping;
        }
        match service.status.as_str() {
            "starting" => ServiceState::Starting,
            "running" => ServiceState::Running,
            "stopping" => ServiceState::Stopping,
            "removing" => ServiceState::Removing,
            "exited" | "dead" => ServiceState::Exited,
            _ => ServiceState::Stopped,
        }
    }

    /// Issue a lifecycle command. Serialized per service; the latest
    /// caller wins races, earlier ones see `superseded` or `cancelled`.
    pub async fn execute(self: &Arc<Self>, service_id: i64, command: Command) -> Result<ServiceState> {
        self.supervisor.check_writable()?;
        // Fail fast on unknown services instead of spawning an actor.
        self.store.get_service(service_id).await?;

        let (tx, in_flight) = {
            let handle = self.actors.entry(service_id).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                let in_flight: Arc<Mutex<Option<CancellationToken>>> =
                    Arc::new(Mutex::new(None));
                let manager = Arc::clone(self);
                let flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    manager.actor_loop(service_id, rx, flight).await;
                });
                Handle { tx, in_flight }
            });
            (handle.tx.clone(), Arc::clone(&handle.in_flight))
        };

        let cancel = self.shutdown.child_token();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            command,
            cancel,
            reply: reply_tx,
        };

        // Snapshot the in-flight token BEFORE enqueueing: once the actor
        // dequeues our envelope it becomes the in-flight op, and firing
        // the token read after the send could cancel ourselves.
        let superseded = in_flight.lock().clone();
        match tx.try_send(envelope) {
            Ok(()) => {
                // Latest wins: supersede whatever was executing.
                if let Some(current) = superseded {
                    current.cancel();
                }
            }
            Err(mpsc::error::TrySendError::Full(env)) => {
                let _ = env.reply.send(Err(Error::Busy));
                return Err(Error::Busy);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Actor exited (service removed); caller raced a delete.
                return Err(Error::NotFound(format!("service {service_id}")));
            }
        }

        reply_rx
            .await
            .unwrap_or(Err(Error::Internal("lifecycle actor dropped reply".into())))
    }

    async fn actor_loop(
        self: Arc<Self>,
        service_id: i64,
        mut rx: mpsc::Receiver<Envelope>,
        in_flight: Arc<Mutex<Option<CancellationToken>>>,
    ) {
        while let Some(mut envelope) = rx.recv().await {
            // Coalesce: drain the queue, keeping only the newest command.
            while let Ok(newer) = rx.try_recv() {
                envelope.cancel.cancel();
                let _ = envelope.reply.send(Err(Error::Superseded));
                envelope = newer;
            }
            if envelope.cancel.is_cancelled() {
                let _ = envelope.reply.send(Err(Error::Cancelled));
                continue;
            }

            *in_flight.lock() = Some(envelope.cancel.clone());
            let result = self
                .run_command(service_id, envelope.command, &envelope.cancel)
                .await;
            *in_flight.lock() = None;

            let removed = matches!(
                (envelope.command, &result),
                (Command::Remove, Ok(ServiceState::Removing))
            );
            let _ = envelope.reply.send(result);

            if removed {
                self.actors.remove(&service_id);
                return;
            }
            if self.shutdown.is_cancelled() {
                return;
            }
        }
    }

    async fn run_command(
        &self,
        service_id: i64,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<ServiceState> {
        // Disconnected engine stream: preserve state, block until the
        // link is back or the command is cancelled.
        self.wait_engine_link(cancel).await?;

        let service = self.store.get_service(service_id).await?;
        match command {
            Command::Start => self.do_start(service, cancel).await,
            Command::Stop => {
                let state = self.do_stop(&service, cancel, true).await?;
                Ok(state)
            }
            Command::Restart => {
                if service.crash_looping {
                    return Err(Error::CrashLooping);
                }
                // Stop half; no `Stopped` settlement in between.
                self.do_stop(&service, cancel, false).await?;
                let fresh = self.store.get_service(service_id).await?;
                self.do_start(fresh, cancel).await
            }
            Command::Unlock => self.do_unlock(&service).await,
            Command::Remove => self.do_remove(&service, cancel).await,
        }
    }

    async fn do_start(
        &self,
        service: Service,
        cancel: &CancellationToken,
    ) -> Result<ServiceState> {
        if service.crash_looping {
            return Err(Error::CrashLooping);
        }

        self.store
            .set_desired_state(service.id, DesiredState::Running)
            .await?;
        self.store.update_status(service.id, "starting", None).await?;
        self.cache
            .update(service.id, service.container_id.clone(), "starting", None);

        match self.materialize(&service, cancel).await {
            Ok(container_id) => {
                self.store.update_status(service.id, "running", None).await?;
                self.cache
                    .update(service.id, Some(container_id), "running", None);
                tracing::info!(service_id = service.id, "service started");
                Ok(ServiceState::Running)
            }
            Err(Error::Cancelled) | Err(Error::Superseded) => Err(Error::Cancelled),
            Err(err) => {
                tracing::warn!(service_id = service.id, error = %err, "start failed");
                // Settle back at Stopped; the engine owns no running
                // container for this service.
                self.store
                    .set_desired_state(service.id, DesiredState::Stopped)
                    .await?;
                self.store.update_status(service.id, "stopped", None).await?;
                self.cache.update(service.id, None, "stopped", None);
                Err(err)
            }
        }
    }

    /// Pull, create, attach, start. Returns the bound container id.
    async fn materialize(
        &self,
        service: &Service,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let project = self.store.get_project(service.project_id).await?;
        let network = project.network_name();

        let engine = &self.engine;
        let pull_timeout = self.pull_timeout;
        self.with_retries(cancel, || {
            let image = service.image.clone();
            let cancel = cancel.clone();
            async move { timed(pull_timeout, engine.pull_image(&image, &cancel)).await }
        })
        .await?;

        self.with_retries(cancel, || {
            let network = network.clone();
            async move {
                engine
                    .ensure_network(&network, project.id)
                    .await
                    .map_err(Error::from)
            }
        })
        .await?;

        let spec = CreateSpec {
            service_id: service.id,
            project_id: project.id,
            container_name: crate::net::container_name(project.id, &service.name),
            image: service.image.clone(),
            env: service.env.clone(),
            ports: service.ports.clone(),
            volumes: service.volumes.clone(),
            aliases: crate::net::service_aliases(&service.name, &project.name),
            restart_max_retries: self.policy.threshold,
        };

        let timeout = self.start_stop_timeout;
        let container_id = self
            .with_retries(cancel, || {
                let spec = spec.clone();
                let cancel = cancel.clone();
                async move { timed(timeout, engine.create_container(&spec, &cancel)).await }
            })
            .await?;

        // Exactly one container is bound to a service at a time.
        self.store.bind_container(service.id, &container_id).await?;

        self.with_retries(cancel, || {
            let network = network.clone();
            let container_id = container_id.clone();
            let aliases = spec.aliases.clone();
            async move {
                engine
                    .connect_network(&network, &container_id, &aliases)
                    .await
                    .map_err(Error::from)
            }
        })
        .await?;

        // Service links: pull each peer's aliases into this service's
        // network. Best-effort; a missing peer container is logged, not
        // fatal to the start.
        for peer_id in &service.links {
            match self.store.get_service(*peer_id).await {
                Ok(peer) => {
                    let Some(peer_container) = peer.container_id.as_deref() else {
                        tracing::warn!(
                            service_id = service.id,
                            peer_id,
                            "linked service has no container; alias skipped"
                        );
                        continue;
                    };
                    let peer_project = self.store.get_project(peer.project_id).await?;
                    let aliases = crate::net::service_aliases(&peer.name, &peer_project.name);
                    if let Err(e) = engine
                        .connect_network(&network, peer_container, &aliases)
                        .await
                    {
                        tracing::warn!(
                            service_id = service.id,
                            peer_id,
                            error = %e,
                            "failed to attach linked service alias"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(service_id = service.id, peer_id, error = %e, "broken link");
                }
            }
        }

        self.with_retries(cancel, || {
            let container_id = container_id.clone();
            let cancel = cancel.clone();
            async move { timed(timeout, engine.start_container(&container_id, &cancel)).await }
        })
        .await?;

        Ok(container_id)
    }

    async fn do_stop(
        &self,
        service: &Service,
        cancel: &CancellationToken,
        settle: bool,
    ) -> Result<ServiceState> {
        // Desired state first: the `die` that follows is user-requested
        // and must not feed the crash-loop counter.
        self.store
            .set_desired_state(service.id, DesiredState::Stopped)
            .await?;
        self.store.update_status(service.id, "stopping", None).await?;
        self.cache
            .update(service.id, service.container_id.clone(), "stopping", None);

        if let Some(container_id) = &service.container_id {
            let engine = &self.engine;
            let grace = self.stop_grace_secs;
            let timeout = self.start_stop_timeout + Duration::from_secs(grace as u64);
            let result = self
                .with_retries(cancel, || {
                    let container_id = container_id.clone();
                    let cancel = cancel.clone();
                    async move {
                        timed(timeout, engine.stop_container(&container_id, grace, &cancel)).await
                    }
                })
                .await;
            match result {
                Ok(()) => {}
                // Already gone is a successful stop.
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if settle {
            self.store.update_status(service.id, "stopped", None).await?;
            self.cache
                .update(service.id, service.container_id.clone(), "stopped", None);
            tracing::info!(service_id = service.id, "service stopped");
        }
        Ok(ServiceState::Stopped)
    }

    async fn do_unlock(&self, service: &Service) -> Result<ServiceState> {
        if !service.crash_looping {
            return Err(Error::Conflict(format!(
                "service {} is not crash-looping",
                service.id
            )));
        }
        self.store
            .set_crash_state(service.id, 0, None, false)
            .await?;
        self.store
            .set_health(service.id, HealthStatus::Unknown, None)
            .await?;
        self.store
            .update_status(service.id, "stopped", service.last_exit_code)
            .await?;
        self.cache.update(
            service.id,
            service.container_id.clone(),
            "stopped",
            service.last_exit_code,
        );
        tracing::info!(service_id = service.id, "crash-loop latch cleared");
        Ok(ServiceState::Stopped)
    }

    /// Delete flow: latch `Removing`, best-effort container removal, then
    /// the transactional cascade (routes → service row).
    async fn do_remove(&self, service: &Service, cancel: &CancellationToken) -> Result<ServiceState> {
        self.store
            .set_desired_state(service.id, DesiredState::Stopped)
            .await?;
        self.store.update_status(service.id, "removing", None).await?;
        self.cache
            .update(service.id, service.container_id.clone(), "removing", None);

        if let Some(container_id) = &service.container_id {
            let engine = &self.engine;
            let result = self
                .with_retries(cancel, || {
                    let container_id = container_id.clone();
                    let cancel = cancel.clone();
                    async move {
                        engine
                            .remove_container(&container_id, true, &cancel)
                            .await
                            .map_err(Error::from)
                    }
                })
                .await;
            match result {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(
                        service_id = service.id,
                        error = %err,
                        "container removal failed; row kept"
                    );
                    return Err(err);
                }
            }
        }

        let mut tx = self.store.begin().await?;
        self.store
            .delete_routes_for_service(&mut tx, service.id)
            .await?;
        self.store.delete_service(&mut tx, service.id).await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit service delete: {e}")))?;

        self.cache.remove(service.id);
        self.bus.drop_service_topics(service.id);
        tracing::info!(service_id = service.id, "service removed");
        Ok(ServiceState::Removing)
    }

    // ── Engine event application (trigger T2) ───────────────────

    /// Apply one engine lifecycle event. Never fails: errors are logged
    /// and the pump moves on.
    pub async fn observe_event(&self, event: &EngineEvent) {
        if let Err(err) = self.apply_event(event).await {
            tracing::warn!(
                container_id = %event.container_id,
                error = %err,
                "failed to apply engine event"
            );
        }
    }

    async fn apply_event(&self, event: &EngineEvent) -> Result<()> {
        let service = match event.service_id {
            Some(id) => match self.store.get_service(id).await {
                Ok(service) => service,
                // Row already gone (delete raced the event): orphan.
                Err(crate::store::StoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            },
            None => match self
                .store
                .get_service_by_container(&event.container_id)
                .await?
            {
                Some(service) => service,
                None => return Ok(()),
            },
        };

        // Events for an unbound or prior-incarnation container are orphans.
        if service.container_id.as_deref() != Some(event.container_id.as_str()) {
            return Ok(());
        }

        match event.action {
            EventAction::Start => {
                self.store
                    .apply_observed_status(service.id, &event.container_id, "running", None, event.at)
                    .await?;
            }
            EventAction::Die => {
                self.store
                    .apply_observed_status(
                        service.id,
                        &event.container_id,
                        "exited",
                        event.exit_code,
                        event.at,
                    )
                    .await?;

                // Only unexpected deaths feed the counter; a user-requested
                // stop (desired = stopped) suppresses it.
                if service.desired_state == DesiredState::Running {
                    let verdict = observe_die(
                        service.restart_count,
                        service.restart_window_start,
                        Utc::now(),
                        self.policy,
                    );
                    self.store
                        .set_crash_state(
                            service.id,
                            verdict.restart_count,
                            Some(verdict.window_start),
                            verdict.latched,
                        )
                        .await?;
                    if verdict.latched && !service.crash_looping {
                        self.store
                            .set_health(service.id, HealthStatus::Unknown, None)
                            .await?;
                        tracing::warn!(
                            service_id = service.id,
                            restart_count = verdict.restart_count,
                            "crash loop latched; start requests rejected until unlock"
                        );
                    }
                }
            }
            EventAction::Stop => {
                self.store
                    .apply_observed_status(service.id, &event.container_id, "stopped", None, event.at)
                    .await?;
            }
            // `oom` precedes `die`; `create`/`kill`/`destroy` carry no
            // settled state the row needs.
            EventAction::OomKill
            | EventAction::Create
            | EventAction::Kill
            | EventAction::Destroy => {}
        }
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────

    async fn wait_engine_link(&self, cancel: &CancellationToken) -> Result<()> {
        let mut link = self.engine_up.clone();
        loop {
            if *link.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = link.changed() => {
                    if changed.is_err() {
                        return Err(Error::EngineUnavailable("engine link closed".into()));
                    }
                }
            }
        }
    }

    /// Retry transient engine failures with 200/800/3200 ms backoff; each
    /// sleep races the command's cancellation token.
    async fn with_retries<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(Error::EngineUnavailable(msg)) if attempt < RETRY_DELAYS_MS.len() => {
                    let delay = Duration::from_millis(RETRY_DELAYS_MS[attempt]);
                    attempt += 1;
                    tracing::debug!(attempt, error = %msg, "transient engine error; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

async fn timed<T>(
    duration: Duration,
    fut: impl Future<Output = std::result::Result<T, EngineError>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(EngineError::Cancelled)) => Err(Error::Cancelled),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::EngineUnavailable("engine call timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::store::{PortMap, ServiceSpec};

    struct Rig {
        store: Arc<Store>,
        engine: Arc<FakeEngine>,
        cache: Arc<StatusCache>,
        manager: Arc<LifecycleManager>,
        service_id: i64,
    }

    async fn rig() -> Rig {
        let store = Arc::new(Store::open_memory().await.unwrap());
        let engine = Arc::new(FakeEngine::new());
        let cache = Arc::new(StatusCache::new());
        let bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(Supervisor::new());
        let (_up_tx, up_rx) = watch::channel(true);
        // Leak the sender so the link stays "up" for the test's lifetime.
        std::mem::forget(_up_tx);

        let mut tx = store.begin().await.unwrap();
        let project = store.create_project(&mut tx, "demo").await.unwrap();
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.ports = vec![PortMap {
            container: 80,
            host: 8080,
        }];
        let service = store
            .create_service(&mut tx, project.id, &spec)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let manager = LifecycleManager::new(
            Arc::clone(&store),
            engine.clone() as Arc<dyn ContainerEngine>,
            Arc::clone(&cache),
            bus,
            supervisor,
            &Config::default(),
            up_rx,
        );

        Rig {
            store,
            engine,
            cache,
            manager,
            service_id: service.id,
        }
    }

    #[tokio::test]
    async fn start_materializes_container() {
        let rig = rig().await;
        let state = rig
            .manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        assert_eq!(state, ServiceState::Running);

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert_eq!(service.status, "running");
        assert_eq!(service.desired_state, DesiredState::Running);
        let container = rig.engine.container_for_service(rig.service_id).unwrap();
        assert!(container.running);
        assert_eq!(service.container_id.as_deref(), Some(container.id.as_str()));
        assert_eq!(rig.engine.networks(), vec![format!("proj_{}", service.project_id)]);
        assert_eq!(rig.cache.get(rig.service_id).unwrap().state, "running");
    }

    #[tokio::test]
    async fn start_is_idempotent_on_rebound_container() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let first = rig.engine.container_for_service(rig.service_id).unwrap();

        rig.manager
            .execute(rig.service_id, Command::Stop)
            .await
            .unwrap();
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let second = rig.engine.container_for_service(rig.service_id).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn failed_pull_settles_at_stopped() {
        let rig = rig().await;
        rig.engine
            .fail_next_pull(EngineError::ImagePullFailed("no such image".into()));

        let err = rig
            .manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "image_pull_failed");

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert_eq!(service.status, "stopped");
        assert_eq!(service.desired_state, DesiredState::Stopped);
        assert_eq!(service.last_exit_code, None);
        assert_eq!(rig.engine.start_calls(), 0);
    }

    #[tokio::test]
    async fn port_conflict_is_typed() {
        let rig = rig().await;
        rig.engine
            .fail_next_start(EngineError::PortConflict("8080 busy".into()));
        let err = rig
            .manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "port_conflict");
    }

    #[tokio::test]
    async fn stop_suppresses_crash_counter() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let container = rig.engine.container_for_service(rig.service_id).unwrap();

        rig.manager
            .execute(rig.service_id, Command::Stop)
            .await
            .unwrap();

        // The expected post-stop die event.
        let event = EngineEvent {
            container_id: container.id.clone(),
            service_id: Some(rig.service_id),
            action: EventAction::Die,
            exit_code: Some(0),
            at: Utc::now(),
        };
        rig.manager.observe_event(&event).await;

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert_eq!(service.restart_count, 0);
        assert!(!service.crash_looping);
    }

    #[tokio::test]
    async fn five_unexpected_deaths_latch_crash_loop() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let container = rig.engine.container_for_service(rig.service_id).unwrap();

        for _ in 0..5 {
            let event = EngineEvent {
                container_id: container.id.clone(),
                service_id: Some(rig.service_id),
                action: EventAction::Die,
                exit_code: Some(1),
                at: Utc::now(),
            };
            rig.manager.observe_event(&event).await;
        }

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert!(service.crash_looping);
        assert_eq!(service.restart_count, 5);
        assert_eq!(service.health_status, HealthStatus::Unknown);
        assert_eq!(
            LifecycleManager::present_state(&service),
            ServiceState::CrashLooping
        );

        // Latched: start is rejected until unlock.
        let err = rig
            .manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "crash_looping");
    }

    #[tokio::test]
    async fn unlock_clears_latch_and_counter() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let container = rig.engine.container_for_service(rig.service_id).unwrap();
        for _ in 0..5 {
            rig.manager
                .observe_event(&EngineEvent {
                    container_id: container.id.clone(),
                    service_id: Some(rig.service_id),
                    action: EventAction::Die,
                    exit_code: Some(1),
                    at: Utc::now(),
                })
                .await;
        }

        let state = rig
            .manager
            .execute(rig.service_id, Command::Unlock)
            .await
            .unwrap();
        assert_eq!(state, ServiceState::Stopped);

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert!(!service.crash_looping);
        assert_eq!(service.restart_count, 0);
        assert!(service.restart_window_start.is_none());

        // Start works again after unlock.
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unlock_without_latch_conflicts() {
        let rig = rig().await;
        let err = rig
            .manager
            .execute(rig.service_id, Command::Unlock)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn orphan_events_are_ignored() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();

        // Event for a container from a prior incarnation.
        rig.manager
            .observe_event(&EngineEvent {
                container_id: "stale-container".into(),
                service_id: Some(rig.service_id),
                action: EventAction::Die,
                exit_code: Some(1),
                at: Utc::now(),
            })
            .await;

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert_eq!(service.status, "running");
        assert_eq!(service.restart_count, 0);
    }

    #[tokio::test]
    async fn remove_deletes_row_and_container() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let container = rig.engine.container_for_service(rig.service_id).unwrap();

        let state = rig
            .manager
            .execute(rig.service_id, Command::Remove)
            .await
            .unwrap();
        assert_eq!(state, ServiceState::Removing);
        assert!(rig.engine.container(&container.id).is_none());
        assert!(matches!(
            rig.store.get_service(rig.service_id).await,
            Err(crate::store::StoreError::NotFound(_))
        ));
        assert!(rig.cache.get(rig.service_id).is_none());
    }

    #[tokio::test]
    async fn restart_passes_through_without_stopped_settlement() {
        let rig = rig().await;
        rig.manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        let state = rig
            .manager
            .execute(rig.service_id, Command::Restart)
            .await
            .unwrap();
        assert_eq!(state, ServiceState::Running);
        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert_eq!(service.status, "running");
        assert_eq!(service.desired_state, DesiredState::Running);
    }

    #[tokio::test]
    async fn concurrent_commands_coalesce_to_latest() {
        let rig = rig().await;
        rig.engine.set_op_delay(Duration::from_millis(50));

        let m1 = Arc::clone(&rig.manager);
        let m2 = Arc::clone(&rig.manager);
        let m3 = Arc::clone(&rig.manager);
        let id = rig.service_id;

        let first = tokio::spawn(async move { m1.execute(id, Command::Start).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = tokio::spawn(async move { m2.execute(id, Command::Stop).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = tokio::spawn(async move { m3.execute(id, Command::Start).await });

        let (first, second, third) = (
            first.await.unwrap(),
            second.await.unwrap(),
            third.await.unwrap(),
        );

        // The last start wins; the middle stop never reaches the engine.
        assert_eq!(third.unwrap(), ServiceState::Running);
        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(rig.engine.stop_calls(), 0);
        assert_eq!(rig.engine.start_calls(), 1);

        let service = rig.store.get_service(rig.service_id).await.unwrap();
        assert_eq!(service.status, "running");
    }

    #[tokio::test]
    async fn linked_peer_aliases_join_the_network() {
        let rig = rig().await;
        // A second project owning the peer; links are the only sanctioned
        // cross-project path.
        let mut tx = rig.store.begin().await.unwrap();
        let other = rig.store.create_project(&mut tx, "backend").await.unwrap();
        let peer = rig
            .store
            .create_service(&mut tx, other.id, &ServiceSpec::image("db", "postgres:16"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let (_up_tx, up_rx) = watch::channel(true);
        std::mem::forget(_up_tx);
        let manager = LifecycleManager::new(
            Arc::clone(&rig.store),
            rig.engine.clone() as Arc<dyn ContainerEngine>,
            Arc::clone(&rig.cache),
            Arc::new(EventBus::new()),
            Arc::new(Supervisor::new()),
            &Config::default(),
            up_rx,
        );
        manager.execute(peer.id, Command::Start).await.unwrap();
        let peer_container = rig.engine.container_for_service(peer.id).unwrap();

        // A linked web service pulls the peer's aliases into its own
        // project network.
        let mut tx = rig.store.begin().await.unwrap();
        let mut spec = ServiceSpec::image("linked", "nginx:alpine");
        spec.links = vec![peer.id];
        let project = rig.store.get_project_by_name("demo").await.unwrap();
        let linked = rig
            .store
            .create_service(&mut tx, project.id, &spec)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        manager.execute(linked.id, Command::Start).await.unwrap();

        let network = format!("proj_{}", project.id);
        let attached = rig
            .engine
            .connections()
            .into_iter()
            .any(|(net, container, aliases)| {
                net == network
                    && container == peer_container.id
                    && aliases.contains(&"db.backend.local".to_string())
            });
        assert!(attached, "peer aliases never joined the caller's network");
    }

    #[tokio::test]
    async fn lockdown_vetoes_lifecycle_commands() {
        let rig = rig().await;
        let supervisor = Arc::new(Supervisor::new());
        supervisor.lockdown("maintenance", "admin");
        let (_up_tx, up_rx) = watch::channel(true);
        std::mem::forget(_up_tx);
        let manager = LifecycleManager::new(
            Arc::clone(&rig.store),
            rig.engine.clone() as Arc<dyn ContainerEngine>,
            Arc::clone(&rig.cache),
            Arc::new(EventBus::new()),
            supervisor,
            &Config::default(),
            up_rx,
        );

        let err = manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "locked_down");
    }

    #[tokio::test]
    async fn transient_engine_errors_are_retried() {
        let rig = rig().await;
        rig.engine
            .fail_next_start(EngineError::Unreachable("socket hiccup".into()));

        // One transient failure, then success on retry.
        let state = rig
            .manager
            .execute(rig.service_id, Command::Start)
            .await
            .unwrap();
        assert_eq!(state, ServiceState::Running);
        assert_eq!(rig.engine.start_calls(), 1);
    }
}
