//! Kernel façade — the operations the control surface calls.
//!
//! Every entry point takes an explicit [`Actor`]; mutations check the
//! supervisor, run inside store transactions where a cascade or index
//! update must be atomic, and leave an audit entry under the actor's
//! correlation id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;

use crate::actor::{Actor, Role};
use crate::certs::{CertManager, KeyMetadata};
use crate::config::Config;
use crate::engine::{ContainerEngine, ContainerSummary};
use crate::error::{Error, Result};
use crate::events::{EventBus, StatusCache, StreamHub};
use crate::health::HealthProber;
use crate::jobs::{JobKind, JobQueue, JobRecord};
use crate::lifecycle::{Command, LifecycleManager, ServiceState};
use crate::proxy::{ProxyReconciler, ProxyStatus, ReconcileOutcome};
use crate::store::{
    CertType, HealthStatus, Project, Route, RouteSpec, SearchHit, Service, ServiceSpec, Store,
    Token,
};
use crate::supervisor::{Lockdown, Supervisor};

/// Everything the HTTP layer needs, in one place.
pub struct Kernel {
    pub config: Config,
    pub store: Arc<Store>,
    pub engine: Arc<dyn ContainerEngine>,
    pub machine: Arc<LifecycleManager>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<StatusCache>,
    pub supervisor: Arc<Supervisor>,
    pub prober: Arc<HealthProber>,
    pub reconciler: Arc<ProxyReconciler>,
    pub certs: Arc<CertManager>,
    pub jobs: Arc<JobQueue>,
    pub streams: Arc<StreamHub>,
}

/// Read-time service detail: row data plus computed network facts.
/// Env values are never part of it.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetail {
    #[serde(flatten)]
    pub service: Service,
    pub state: ServiceState,
    pub network: String,
    pub aliases: Vec<String>,
    pub dns_hint: String,
    pub curl_hint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateDetail {
    pub id: i64,
    pub domain: String,
    pub cert_type: CertType,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub auto_renew: bool,
    /// Length and truncated digest only; never ciphertext, never
    /// plaintext.
    pub key: KeyMetadata,
}

impl Kernel {
    // ── Authentication ──────────────────────────────────────────

    /// Verify a bearer secret against the stored bcrypt hashes. The token
    /// count is small (operators, CI); a linear scan keeps lookup free of
    /// any plaintext-derived index.
    pub async fn authenticate(&self, secret: &str) -> Result<Actor> {
        for token in self.store.list_tokens().await? {
            if bcrypt::verify(secret, &token.secret_hash).unwrap_or(false) {
                if let Err(e) = self.store.touch_token(token.id).await {
                    tracing::debug!(error = %e, "failed to stamp token usage");
                }
                return Ok(Actor::new(token.name, token.role));
            }
        }
        Err(Error::Unauthorized)
    }

    /// Consume `ADMIN_TOKEN` into a hashed `admin` row on first boot.
    pub async fn bootstrap_admin(&self) -> Result<()> {
        let Some(secret) = self.config.admin_token.as_deref() else {
            return Ok(());
        };
        if self.store.get_token_by_name("admin").await?.is_some() {
            return Ok(());
        }
        let hash = bcrypt::hash(secret, bcrypt::DEFAULT_COST)
            .map_err(|e| Error::Internal(format!("hash admin token: {e}")))?;
        let mut tx = self.store.begin().await?;
        self.store
            .create_token(&mut tx, "admin", &hash, Role::Admin)
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit bootstrap token: {e}")))?;
        tracing::info!("bootstrap admin token stored (hash only)");
        Ok(())
    }

    pub async fn create_token(&self, actor: &Actor, name: &str, secret: &str, role: Role) -> Result<Token> {
        self.supervisor.check_writable()?;
        crate::net::validate_dns_label(name)?;
        let hash = bcrypt::hash(secret, bcrypt::DEFAULT_COST)
            .map_err(|e| Error::Internal(format!("hash token: {e}")))?;
        let mut tx = self.store.begin().await?;
        let token = self.store.create_token(&mut tx, name, &hash, role).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "token.create",
                &format!("token:{name}"),
                serde_json::json!({"role": role.as_str()}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit token: {e}")))?;
        Ok(token)
    }

    pub async fn delete_token(&self, actor: &Actor, name: &str) -> Result<()> {
        self.supervisor.check_writable()?;
        let mut tx = self.store.begin().await?;
        self.store.delete_token_by_name(&mut tx, name).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "token.delete",
                &format!("token:{name}"),
                serde_json::json!({}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit token delete: {e}")))
    }

    // ── Projects ────────────────────────────────────────────────

    pub async fn create_project(&self, actor: &Actor, name: &str) -> Result<Project> {
        self.supervisor.check_writable()?;
        crate::net::validate_dns_label(name)?;
        let mut tx = self.store.begin().await?;
        let project = self.store.create_project(&mut tx, name).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "project.create",
                &format!("project:{}", project.id),
                serde_json::json!({"name": name}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit project: {e}")))?;
        Ok(project)
    }

    /// Delete a project. Without `force`, a project that still owns
    /// services is a conflict; with it, the cascade runs routes →
    /// services (containers force-removed) → project under one
    /// correlation id, and the proxy reconciles once at the end.
    pub async fn delete_project(&self, actor: &Actor, id: i64, force: bool) -> Result<()> {
        self.supervisor.check_writable()?;
        let project = self.store.get_project(id).await?;
        let services = self.store.list_services(id).await?;

        if !services.is_empty() && !force {
            return Err(Error::Conflict(format!(
                "project {} still owns {} service(s)",
                project.name,
                services.len()
            )));
        }

        for service in &services {
            self.remove_service_internal(actor, service.id).await?;
        }

        let mut tx = self.store.begin().await?;
        self.store.delete_project(&mut tx, id).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "project.delete",
                &format!("project:{id}"),
                serde_json::json!({"name": project.name, "cascaded_services": services.len()}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit project delete: {e}")))?;

        if !services.is_empty() {
            self.reconciler.trigger();
        }
        Ok(())
    }

    // ── Services ────────────────────────────────────────────────

    pub async fn create_service(
        &self,
        actor: &Actor,
        project_id: i64,
        spec: &ServiceSpec,
    ) -> Result<Service> {
        self.supervisor.check_writable()?;
        crate::net::validate_dns_label(&spec.name)?;
        self.store.get_project(project_id).await?;

        let mut tx = self.store.begin().await?;
        let service = self.store.create_service(&mut tx, project_id, spec).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "service.create",
                &format!("service:{}", service.id),
                serde_json::json!({"name": spec.name, "image": spec.image}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit service: {e}")))?;
        Ok(service)
    }

    pub async fn service_detail(&self, id: i64) -> Result<ServiceDetail> {
        let service = self.store.get_service(id).await?;
        let project = self.store.get_project(service.project_id).await?;
        let port = service.ports.first().map(|p| p.container);
        Ok(ServiceDetail {
            state: LifecycleManager::present_state(&service),
            network: project.network_name(),
            aliases: crate::net::service_aliases(&service.name, &project.name),
            dns_hint: crate::net::dns_hint(&service.name, &project.name),
            curl_hint: crate::net::curl_hint(&service.name, &project.name, port),
            service,
        })
    }

    pub async fn lifecycle(&self, actor: &Actor, id: i64, command: Command) -> Result<ServiceState> {
        if command == Command::Unlock && !actor.can(Role::Deployer) {
            return Err(Error::Forbidden("unlock requires deployer role".into()));
        }
        let result = self.machine.execute(id, command).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        let _ = self
            .store
            .audit_record(
                actor,
                &format!("service.{}", command.as_str()),
                &format!("service:{id}"),
                serde_json::json!({"status": status}),
            )
            .await;
        result
    }

    pub async fn delete_service(&self, actor: &Actor, id: i64) -> Result<()> {
        self.supervisor.check_writable()?;
        let had_routes = !self.store.list_routes(id).await?.is_empty();
        self.remove_service_internal(actor, id).await?;
        if had_routes {
            self.reconciler.trigger();
        }
        Ok(())
    }

    async fn remove_service_internal(&self, actor: &Actor, id: i64) -> Result<()> {
        self.machine.execute(id, Command::Remove).await?;
        let _ = self
            .store
            .audit_record(
                actor,
                "service.delete",
                &format!("service:{id}"),
                serde_json::json!({}),
            )
            .await;
        Ok(())
    }

    /// Attach a service row to an existing unmanaged container, verifying
    /// label-free state first.
    pub async fn adopt_container(
        &self,
        actor: &Actor,
        service_id: i64,
        container_id: &str,
    ) -> Result<Service> {
        self.supervisor.check_writable()?;
        self.store.get_service(service_id).await?;

        let state = self.engine.inspect_container(container_id).await?;
        if state.is_managed() {
            return Err(Error::Conflict(format!(
                "container {container_id} is already managed"
            )));
        }

        self.store.bind_container(service_id, &state.id).await?;
        self.store
            .update_status(service_id, &state.status, state.exit_code)
            .await?;
        self.cache
            .update(service_id, Some(state.id.clone()), &state.status, state.exit_code);
        let _ = self
            .store
            .audit_record(
                actor,
                "service.adopt",
                &format!("service:{service_id}"),
                serde_json::json!({"container_id": state.id}),
            )
            .await;
        self.store.get_service(service_id).await.map_err(Into::into)
    }

    pub async fn discover_unmanaged(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.engine.list_unmanaged().await?)
    }

    // ── Routes ──────────────────────────────────────────────────

    pub async fn create_route(
        &self,
        actor: &Actor,
        service_id: i64,
        spec: &RouteSpec,
    ) -> Result<Route> {
        self.supervisor.check_writable()?;
        let service = self.store.get_service(service_id).await?;

        if !service.has_container_port(spec.port) {
            return Err(Error::Validation(format!(
                "port {} is not in the service's port map",
                spec.port
            )));
        }
        if spec.tls {
            let covered = match spec.certificate_id {
                Some(cert_id) => self.store.get_certificate(cert_id).await?.domain == spec.domain,
                None => self
                    .store
                    .get_certificate_by_domain(&spec.domain)
                    .await?
                    .is_some(),
            };
            if !covered {
                return Err(Error::Validation(format!(
                    "tls route requires a certificate covering {}",
                    spec.domain
                )));
            }
        }

        let mut tx = self.store.begin().await?;
        let route = self.store.create_route(&mut tx, service_id, spec).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "route.create",
                &format!("route:{}", route.id),
                serde_json::json!({"domain": spec.domain, "port": spec.port}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit route: {e}")))?;

        self.reconciler.trigger();
        Ok(route)
    }

    pub async fn delete_route(&self, actor: &Actor, id: i64) -> Result<()> {
        self.supervisor.check_writable()?;
        let route = self.store.get_route(id).await?;
        let mut tx = self.store.begin().await?;
        self.store.delete_route(&mut tx, id).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "route.delete",
                &format!("route:{id}"),
                serde_json::json!({"domain": route.domain}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit route delete: {e}")))?;

        self.reconciler.trigger();
        Ok(())
    }

    // ── Certificates ────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn upload_certificate(
        &self,
        actor: &Actor,
        domain: &str,
        cert_type: CertType,
        cert_pem: &str,
        key_pem: &str,
        expires_at: Option<DateTime<Utc>>,
        auto_renew: bool,
    ) -> Result<CertificateDetail> {
        self.supervisor.check_writable()?;
        let cert = self
            .certs
            .store_certificate(actor, domain, cert_type, cert_pem, key_pem, expires_at, auto_renew)
            .await?;
        if self.store.domain_is_routed(domain).await? {
            self.reconciler.trigger();
        }
        Ok(self.certificate_detail_of(&cert))
    }

    pub async fn certificate_detail(&self, id: i64) -> Result<CertificateDetail> {
        let cert = self.store.get_certificate(id).await?;
        Ok(self.certificate_detail_of(&cert))
    }

    pub async fn list_certificates(&self) -> Result<Vec<CertificateDetail>> {
        Ok(self
            .store
            .list_certificates()
            .await?
            .iter()
            .map(|c| self.certificate_detail_of(c))
            .collect())
    }

    fn certificate_detail_of(&self, cert: &crate::store::Certificate) -> CertificateDetail {
        CertificateDetail {
            id: cert.id,
            domain: cert.domain.clone(),
            cert_type: cert.cert_type,
            expires_at: cert.expires_at,
            auto_renew: cert.auto_renew,
            key: self.certs.key_meta(cert),
        }
    }

    pub async fn delete_certificate(&self, actor: &Actor, id: i64) -> Result<()> {
        self.supervisor.check_writable()?;
        let cert = self.store.get_certificate(id).await?;
        let mut tx = self.store.begin().await?;
        self.store.delete_certificate(&mut tx, id).await?;
        self.store
            .audit_append(
                &mut tx,
                actor,
                "cert.delete",
                &format!("certificate:{id}"),
                serde_json::json!({"domain": cert.domain}),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("commit cert delete: {e}")))?;
        self.certs.remove_materialized(&cert.domain).await?;
        Ok(())
    }

    // ── Search ──────────────────────────────────────────────────

    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        Ok(self.store.search(query, limit).await?)
    }

    pub async fn suggest(&self, prefix: &str, limit: i64) -> Result<Vec<String>> {
        Ok(self.store.suggest(prefix, limit).await?)
    }

    pub async fn submit_reindex(&self, actor: &Actor) -> Result<JobRecord> {
        self.supervisor.check_writable()?;
        let store = Arc::clone(&self.store);
        let record = self.jobs.submit(JobKind::Reindex, "rebuild search index", move |ctx| {
            async move {
                ctx.log("rebuilding search documents");
                let count = store.reindex_all().await?;
                ctx.log(format!("indexed {count} documents"));
                Ok(())
            }
            .boxed()
        })?;
        let _ = self
            .store
            .audit_record(
                actor,
                "search.reindex",
                &format!("job:{}", record.id),
                serde_json::json!({}),
            )
            .await;
        Ok(record)
    }

    // ── Supervisor surface ──────────────────────────────────────

    pub async fn lockdown(&self, actor: &Actor, reason: &str) -> Result<Lockdown> {
        let lockdown = self.supervisor.lockdown(reason, &actor.name);
        let _ = self
            .store
            .audit_record(
                actor,
                "system.lockdown",
                "system",
                serde_json::json!({"reason": reason}),
            )
            .await;
        Ok(lockdown)
    }

    pub async fn lift_lockdown(&self, actor: &Actor) -> Result<()> {
        let lifted = self.supervisor.lift_lockdown();
        let _ = self
            .store
            .audit_record(
                actor,
                "system.lift_lockdown",
                "system",
                serde_json::json!({"was_locked": lifted.is_some()}),
            )
            .await;
        Ok(())
    }

    pub async fn emergency_restart(&self, actor: &Actor) -> Result<DateTime<Utc>> {
        let at = self.supervisor.mark_restart_requested();
        let _ = self
            .store
            .audit_record(actor, "system.emergency_restart", "system", serde_json::json!({}))
            .await;
        self.supervisor.begin_shutdown();
        Ok(at)
    }

    // ── Proxy surface ───────────────────────────────────────────

    pub async fn proxy_reload(&self, actor: &Actor) -> Result<ReconcileOutcome> {
        self.supervisor.check_writable()?;
        self.reconciler.reconcile_now(actor).await
    }

    pub async fn proxy_validate(&self) -> Result<String> {
        self.reconciler.validate_only().await
    }

    pub fn proxy_status(&self) -> ProxyStatus {
        self.reconciler.status()
    }

    /// Daily renewal tick: eligible certificates become `cert_renew`
    /// jobs; each successful renewal re-triggers the proxy reconciler.
    pub async fn run_cert_renewal_loop(self: Arc<Self>, issuer: Arc<dyn crate::certs::Issuer>) {
        let shutdown = self.supervisor.shutdown_token();
        // Short initial delay so a restart during an expiry window still
        // renews promptly.
        let mut delay = std::time::Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::time::Duration::from_secs(24 * 60 * 60);

            let candidates = match self.certs.renewal_candidates(Utc::now()).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to list renewal candidates");
                    continue;
                }
            };
            for cert in candidates {
                let kernel = Arc::clone(&self);
                let issuer = Arc::clone(&issuer);
                let label = format!("renew {}", cert.domain);
                let submitted = self.jobs.submit(JobKind::CertRenew, &label, move |ctx| {
                    async move {
                        ctx.log(format!("renewing certificate for {}", cert.domain));
                        let actor = Actor::system();
                        kernel.certs.renew(&actor, &cert, issuer.as_ref()).await?;
                        kernel.reconciler.trigger();
                        Ok(())
                    }
                    .boxed()
                });
                if let Err(e) = submitted {
                    tracing::warn!(error = %e, "failed to enqueue renewal job");
                }
            }
        }
    }

    // ── Health ──────────────────────────────────────────────────

    pub async fn probe_service(&self, actor: &Actor, id: i64) -> Result<HealthStatus> {
        let verdict = self.prober.probe_now(id).await?;
        let _ = self
            .store
            .audit_record(
                actor,
                "service.health_check",
                &format!("service:{id}"),
                serde_json::json!({"verdict": verdict.as_str()}),
            )
            .await;
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::KeyCipher;
    use crate::engine::fake::FakeEngine;
    use crate::proxy::NoopProcess;
    use crate::store::PortMap;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    pub(crate) async fn kernel_with_engine(engine: Arc<FakeEngine>) -> Arc<Kernel> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        // Keep the tempdir alive for the test's duration.
        std::mem::forget(dir);

        let store = Arc::new(Store::open_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(StatusCache::new());
        let supervisor = Arc::new(Supervisor::new());
        let (up_tx, up_rx) = watch::channel(true);
        std::mem::forget(up_tx);

        let machine = LifecycleManager::new(
            Arc::clone(&store),
            engine.clone() as Arc<dyn ContainerEngine>,
            Arc::clone(&cache),
            Arc::clone(&bus),
            Arc::clone(&supervisor),
            &config,
            up_rx,
        );
        let prober = Arc::new(HealthProber::new(
            Arc::clone(&store),
            engine.clone() as Arc<dyn ContainerEngine>,
            &config,
            CancellationToken::new(),
        ));
        let (reconciler, _rx) =
            ProxyReconciler::new(Arc::clone(&store), &config, Box::new(NoopProcess));
        let certs = Arc::new(CertManager::new(
            Arc::clone(&store),
            KeyCipher::from_secret(b"test"),
            &config,
        ));
        certs.ensure_dirs().await.unwrap();
        let jobs = JobQueue::new(Arc::clone(&bus), CancellationToken::new());
        let streams = StreamHub::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            Arc::clone(&bus),
            CancellationToken::new(),
        );

        Arc::new(Kernel {
            config,
            store,
            engine: engine as Arc<dyn ContainerEngine>,
            machine,
            bus,
            cache,
            supervisor,
            prober,
            reconciler,
            certs,
            jobs,
            streams,
        })
    }

    async fn kernel() -> Arc<Kernel> {
        kernel_with_engine(Arc::new(FakeEngine::new())).await
    }

    fn admin() -> Actor {
        Actor::new("admin", Role::Admin)
    }

    #[tokio::test]
    async fn project_name_validation() {
        let kernel = kernel().await;
        let err = kernel
            .create_project(&admin(), "Not_A_Label")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn delete_project_with_services_conflicts_without_force() {
        let kernel = kernel().await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();
        kernel
            .create_service(&actor, project.id, &ServiceSpec::image("web", "nginx:alpine"))
            .await
            .unwrap();

        let err = kernel
            .delete_project(&actor, project.id, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn forced_cascade_shares_correlation_id() {
        let kernel = kernel().await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.ports = vec![PortMap {
            container: 80,
            host: 8080,
        }];
        let service = kernel.create_service(&actor, project.id, &spec).await.unwrap();
        kernel
            .create_route(
                &actor,
                service.id,
                &RouteSpec {
                    domain: "demo.local".into(),
                    path: None,
                    port: 80,
                    tls: false,
                    certificate_id: None,
                },
            )
            .await
            .unwrap();
        kernel
            .lifecycle(&actor, service.id, Command::Start)
            .await
            .unwrap();

        kernel.delete_project(&actor, project.id, true).await.unwrap();

        assert!(kernel.store.list_projects().await.unwrap().is_empty());
        assert!(kernel.store.list_all_routes().await.unwrap().is_empty());

        let entries = kernel.store.audit_recent(50).await.unwrap();
        let cascade: Vec<_> = entries
            .iter()
            .filter(|e| e.correlation_id == actor.correlation_id)
            .collect();
        assert!(cascade.iter().any(|e| e.action == "project.delete"));
        assert!(cascade.iter().any(|e| e.action == "service.delete"));
    }

    #[tokio::test]
    async fn route_port_must_be_in_port_map() {
        let kernel = kernel().await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.ports = vec![PortMap {
            container: 80,
            host: 8080,
        }];
        let service = kernel.create_service(&actor, project.id, &spec).await.unwrap();

        let err = kernel
            .create_route(
                &actor,
                service.id,
                &RouteSpec {
                    domain: "demo.local".into(),
                    path: None,
                    port: 9999,
                    tls: false,
                    certificate_id: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn tls_route_requires_covering_certificate() {
        let kernel = kernel().await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();
        let mut spec = ServiceSpec::image("web", "nginx:alpine");
        spec.ports = vec![PortMap {
            container: 443,
            host: 8443,
        }];
        let service = kernel.create_service(&actor, project.id, &spec).await.unwrap();

        let route = RouteSpec {
            domain: "secure.local".into(),
            path: None,
            port: 443,
            tls: true,
            certificate_id: None,
        };
        let err = kernel
            .create_route(&actor, service.id, &route)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        kernel
            .upload_certificate(
                &actor,
                "secure.local",
                CertType::Manual,
                "chain",
                "key",
                None,
                false,
            )
            .await
            .unwrap();
        kernel.create_route(&actor, service.id, &route).await.unwrap();
    }

    #[tokio::test]
    async fn certificate_detail_redacts_key() {
        let kernel = kernel().await;
        let actor = admin();
        let detail = kernel
            .upload_certificate(
                &actor,
                "demo.local",
                CertType::Manual,
                "chain-pem",
                "super-secret-key-pem",
                None,
                false,
            )
            .await
            .unwrap();

        let json = serde_json::to_string(&detail).unwrap();
        assert!(!json.contains("super-secret-key-pem"));
        assert!(json.contains("digest"));
        assert_eq!(detail.key.length, "super-secret-key-pem".len());
    }

    #[tokio::test]
    async fn token_auth_round_trip() {
        let kernel = kernel().await;
        let actor = admin();
        kernel
            .create_token(&actor, "ci", "s3cret-value", Role::Deployer)
            .await
            .unwrap();

        let authed = kernel.authenticate("s3cret-value").await.unwrap();
        assert_eq!(authed.name, "ci");
        assert_eq!(authed.role, Role::Deployer);

        assert!(matches!(
            kernel.authenticate("wrong").await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn bootstrap_admin_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let mut kernel = kernel_with_engine(engine).await;
        {
            let kernel_mut = Arc::get_mut(&mut kernel).unwrap();
            kernel_mut.config.admin_token = Some("bootstrap-secret".into());
        }
        kernel.bootstrap_admin().await.unwrap();
        kernel.bootstrap_admin().await.unwrap();

        let tokens = kernel.store.list_tokens().await.unwrap();
        assert_eq!(tokens.len(), 1);
        // The plaintext is consumed, never persisted.
        assert_ne!(tokens[0].secret_hash, "bootstrap-secret");
        assert!(kernel.authenticate("bootstrap-secret").await.is_ok());
    }

    #[tokio::test]
    async fn lockdown_vetoes_mutations_but_not_reads() {
        let kernel = kernel().await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();

        kernel.lockdown(&actor, "maintenance").await.unwrap();
        let err = kernel.create_project(&actor, "other").await.unwrap_err();
        assert_eq!(err.kind(), "locked_down");
        // Reads continue.
        assert_eq!(kernel.store.get_project(project.id).await.unwrap().id, project.id);

        kernel.lift_lockdown(&actor).await.unwrap();
        kernel.create_project(&actor, "other").await.unwrap();
    }

    #[tokio::test]
    async fn unlock_requires_deployer() {
        let kernel = kernel().await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();
        let service = kernel
            .create_service(&actor, project.id, &ServiceSpec::image("web", "nginx:alpine"))
            .await
            .unwrap();

        let viewer = Actor::new("ro", Role::Viewer);
        let err = kernel
            .lifecycle(&viewer, service.id, Command::Unlock)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn adoption_rejects_managed_containers() {
        let engine = Arc::new(FakeEngine::new());
        let kernel = kernel_with_engine(Arc::clone(&engine)).await;
        let actor = admin();
        let project = kernel.create_project(&actor, "demo").await.unwrap();
        let service = kernel
            .create_service(&actor, project.id, &ServiceSpec::image("web", "nginx:alpine"))
            .await
            .unwrap();
        kernel.lifecycle(&actor, service.id, Command::Start).await.unwrap();
        let container = engine.container_for_service(service.id).unwrap();

        // The fake's containers all carry managed labels.
        let err = kernel
            .adopt_container(&actor, service.id, &container.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn reindex_job_runs() {
        let kernel = kernel().await;
        let actor = admin();
        kernel.create_project(&actor, "demo").await.unwrap();

        let record = kernel.submit_reindex(&actor).await.unwrap();
        for _ in 0..100 {
            if let Some(job) = kernel.jobs.get(record.id) {
                if job.status == crate::jobs::JobStatus::Succeeded {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("reindex job never succeeded");
    }
}
