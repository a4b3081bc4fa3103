//! Health prober — decides whether a running service is answering.
//!
//! Services with a configured health path are probed on a jittered
//! interval against the container's own network address and
//! container-side port: HTTP HEAD with GET fallback, 1 s per attempt,
//! `ok` on any 2xx/3xx. Crash-looping services are never probed; their
//! verdict is forced to `unknown`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{ContainerEngine, EngineError};
use crate::error::{Error, Result};
use crate::store::{HealthStatus, Service, Store};

/// Container-side port to probe: the first declared container port, or
/// plain HTTP when the service declares none.
pub fn probe_port(service: &Service) -> u16 {
    service.ports.first().map(|p| p.container).unwrap_or(80)
}

/// `http://<container-address>:<container-port><path>`.
pub fn probe_url(address: &str, port: u16, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("http://{address}:{port}{path}")
}

pub struct HealthProber {
    store: Arc<Store>,
    engine: Arc<dyn ContainerEngine>,
    client: reqwest::Client,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HealthProber {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<dyn ContainerEngine>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> HealthProber {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.health_probe_secs))
            .build()
            .unwrap_or_default();
        HealthProber {
            store,
            engine,
            client,
            interval: Duration::from_secs(config.probe_interval_secs),
            shutdown,
        }
    }

    /// Scheduled probe loop. Each cycle sleeps the interval jittered
    /// ±10% so probes never synchronize into bursts.
    pub async fn run(self: Arc<Self>) {
        loop {
            let jitter: f64 = rand::thread_rng().gen_range(0.9..1.1);
            let sleep = self.interval.mul_f64(jitter);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }

            let services = match self.store.list_probeable_services().await {
                Ok(services) => services,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to list probeable services");
                    continue;
                }
            };

            let probes = services.into_iter().map(|service| {
                let prober = Arc::clone(&self);
                async move {
                    if let Err(e) = prober.probe_service(&service).await {
                        tracing::warn!(service_id = service.id, error = %e, "probe failed");
                    }
                }
            });
            futures_util::future::join_all(probes).await;
        }
    }

    /// On-demand probe, also used by the scheduler. Writes the verdict to
    /// the store and returns it.
    pub async fn probe_now(&self, service_id: i64) -> Result<HealthStatus> {
        let service = self.store.get_service(service_id).await?;
        if service.crash_looping {
            self.store
                .set_health(service.id, HealthStatus::Unknown, Some(Utc::now()))
                .await?;
            return Ok(HealthStatus::Unknown);
        }
        self.probe_service(&service).await
    }

    async fn probe_service(&self, service: &Service) -> Result<HealthStatus> {
        if service.health_path.is_none() {
            return Err(Error::Validation(format!(
                "service {} has no health path configured",
                service.id
            )));
        }

        // A health-configured service always gets a verdict: an
        // unaddressable container is simply not answering.
        let verdict = match self.resolve_target(service).await? {
            Some(url) => {
                let verdict = self.probe(&url).await;
                tracing::debug!(
                    service_id = service.id,
                    url = %url,
                    verdict = verdict.as_str(),
                    "probed"
                );
                verdict
            }
            None => HealthStatus::Fail,
        };

        self.store
            .set_health(service.id, verdict, Some(Utc::now()))
            .await?;
        Ok(verdict)
    }

    /// Resolve the probe target through the engine: the bound container's
    /// own address and its container-side port. `None` when the container
    /// is gone or has no address yet.
    async fn resolve_target(&self, service: &Service) -> Result<Option<String>> {
        let Some(path) = service.health_path.as_deref() else {
            return Ok(None);
        };
        let Some(container_id) = service.container_id.as_deref() else {
            return Ok(None);
        };
        match self.engine.inspect_container(container_id).await {
            Ok(state) => Ok(state
                .ip_address
                .map(|address| probe_url(&address, probe_port(service), path))),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// HEAD first, GET fallback; any 2xx/3xx is `ok`.
    pub async fn probe(&self, url: &str) -> HealthStatus {
        if let Ok(response) = self.client.head(url).send().await {
            if is_healthy(response.status()) {
                return HealthStatus::Ok;
            }
        }
        match self.client.get(url).send().await {
            Ok(response) if is_healthy(response.status()) => HealthStatus::Ok,
            _ => HealthStatus::Fail,
        }
    }
}

fn is_healthy(status: reqwest::StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::engine::CreateSpec;
    use crate::store::{PortMap, ServiceSpec};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-status HTTP server for probe tests.
    async fn serve_status(status: u16) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status} NA\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    async fn prober() -> (Arc<Store>, Arc<FakeEngine>, HealthProber) {
        let store = Arc::new(Store::open_memory().await.unwrap());
        let engine = Arc::new(FakeEngine::new());
        let prober = HealthProber::new(
            Arc::clone(&store),
            engine.clone() as Arc<dyn ContainerEngine>,
            &Config::default(),
            CancellationToken::new(),
        );
        (store, engine, prober)
    }

    async fn seed_service(store: &Store, spec: &ServiceSpec) -> Service {
        let mut tx = store.begin().await.unwrap();
        let project = store.create_project(&mut tx, "demo").await.unwrap();
        let service = store
            .create_service(&mut tx, project.id, spec)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        service
    }

    /// Materialize and start a fake container bound to the service.
    async fn bind_running_container(
        store: &Store,
        engine: &FakeEngine,
        service: &Service,
    ) -> String {
        let cancel = CancellationToken::new();
        let container_id = engine
            .create_container(
                &CreateSpec {
                    service_id: service.id,
                    project_id: service.project_id,
                    container_name: format!("glinr_{}_{}", service.project_id, service.name),
                    image: service.image.clone(),
                    env: service.env.clone(),
                    ports: service.ports.clone(),
                    volumes: service.volumes.clone(),
                    aliases: vec![service.name.clone()],
                    restart_max_retries: 5,
                },
                &cancel,
            )
            .await
            .unwrap();
        engine.start_container(&container_id, &cancel).await.unwrap();
        store.bind_container(service.id, &container_id).await.unwrap();
        container_id
    }

    #[tokio::test]
    async fn ok_on_2xx() {
        let (_store, _engine, prober) = prober().await;
        let addr = serve_status(204).await;
        assert_eq!(
            prober.probe(&format!("http://{addr}/healthz")).await,
            HealthStatus::Ok
        );
    }

    #[tokio::test]
    async fn ok_on_3xx() {
        let (_store, _engine, prober) = prober().await;
        let addr = serve_status(302).await;
        assert_eq!(
            prober.probe(&format!("http://{addr}/healthz")).await,
            HealthStatus::Ok
        );
    }

    #[tokio::test]
    async fn fail_on_5xx() {
        let (_store, _engine, prober) = prober().await;
        let addr = serve_status(500).await;
        assert_eq!(
            prober.probe(&format!("http://{addr}/healthz")).await,
            HealthStatus::Fail
        );
    }

    #[tokio::test]
    async fn fail_on_connection_refused() {
        let (_store, _engine, prober) = prober().await;
        // Nothing listens here.
        assert_eq!(
            prober.probe("http://127.0.0.1:9/healthz").await,
            HealthStatus::Fail
        );
    }

    #[tokio::test]
    async fn probe_targets_container_address_and_port() {
        let (store, engine, prober) = prober().await;
        let addr = serve_status(200).await;

        // The listener plays the container: its port is the container
        // port. The host mapping points somewhere dead on purpose, so a
        // wrong target cannot pass.
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.health_path = Some("/healthz".into());
        spec.ports = vec![PortMap {
            container: addr.port(),
            host: 1,
        }];
        let service = seed_service(&store, &spec).await;
        bind_running_container(&store, &engine, &service).await;

        let verdict = prober.probe_now(service.id).await.unwrap();
        assert_eq!(verdict, HealthStatus::Ok);

        let service = store.get_service(service.id).await.unwrap();
        assert_eq!(service.health_status, HealthStatus::Ok);
        assert!(service.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn service_without_ports_is_still_probed() {
        let (store, engine, prober) = prober().await;
        let mut spec = ServiceSpec::image("worker", "busybox:latest");
        spec.health_path = Some("/healthz".into());
        let service = seed_service(&store, &spec).await;
        bind_running_container(&store, &engine, &service).await;

        // Port defaults to 80; whatever answers (or does not), a verdict
        // is recorded rather than a validation error.
        let verdict = prober.probe_now(service.id).await.unwrap();
        assert_ne!(verdict, HealthStatus::Unknown);

        let service = store.get_service(service.id).await.unwrap();
        assert!(service.last_probe_at.is_some());
        assert_eq!(service.health_status, verdict);
    }

    #[tokio::test]
    async fn gone_container_records_fail() {
        let (store, _engine, prober) = prober().await;
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.health_path = Some("/healthz".into());
        spec.ports = vec![PortMap {
            container: 80,
            host: 8080,
        }];
        let service = seed_service(&store, &spec).await;
        // Bound to a container the engine no longer knows.
        store.bind_container(service.id, "ghost").await.unwrap();

        let verdict = prober.probe_now(service.id).await.unwrap();
        assert_eq!(verdict, HealthStatus::Fail);
        let service = store.get_service(service.id).await.unwrap();
        assert_eq!(service.health_status, HealthStatus::Fail);
        assert!(service.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn crash_looping_is_forced_unknown() {
        let (store, engine, prober) = prober().await;
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.health_path = Some("/healthz".into());
        spec.ports = vec![PortMap {
            container: 80,
            host: 8080,
        }];
        let service = seed_service(&store, &spec).await;
        bind_running_container(&store, &engine, &service).await;
        store
            .set_crash_state(service.id, 5, Some(Utc::now()), true)
            .await
            .unwrap();

        let verdict = prober.probe_now(service.id).await.unwrap();
        assert_eq!(verdict, HealthStatus::Unknown);
        let service = store.get_service(service.id).await.unwrap();
        assert!(service.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn probe_without_health_path_is_validation() {
        let (store, _engine, prober) = prober().await;
        let service = seed_service(&store, &ServiceSpec::image("web", "nginx:alpine")).await;

        let err = prober.probe_now(service.id).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn probe_url_shapes() {
        assert_eq!(
            probe_url("172.18.0.5", 80, "healthz"),
            "http://172.18.0.5:80/healthz"
        );
        assert_eq!(
            probe_url("172.18.0.5", 3000, "/status"),
            "http://172.18.0.5:3000/status"
        );
    }

    #[tokio::test]
    async fn probe_port_prefers_declared_container_port() {
        let store = Arc::new(Store::open_memory().await.unwrap());
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.ports = vec![
            PortMap {
                container: 3000,
                host: 8080,
            },
            PortMap {
                container: 9090,
                host: 8081,
            },
        ];
        let service = seed_service(&store, &spec).await;
        assert_eq!(probe_port(&service), 3000);

        let bare = ServiceSpec::image("bare", "busybox:latest");
        let mut tx = store.begin().await.unwrap();
        let project = store.get_project_by_name("demo").await.unwrap();
        let bare = store.create_service(&mut tx, project.id, &bare).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(probe_port(&bare), 80);
    }
}
