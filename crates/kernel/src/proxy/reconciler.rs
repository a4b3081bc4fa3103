//! Staged, atomic application of rendered proxy configuration.
//!
//! Three-slot rotation on disk: `staging.conf` (candidate),
//! `active.conf` (what the proxy serves), `active.conf.backup` (taken
//! before every swap). The rename is atomic on the same filesystem, so
//! the proxy never observes a partially-written file. Rollback is a
//! post-condition of every exit path; a double failure latches
//! `degraded` and the prior config keeps serving.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::render::{config_hash, render_config};
use super::ProxyError;
use crate::actor::Actor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::Store;

/// Control over the external proxy process. Stubbed in tests.
#[async_trait]
pub trait ProxyProcess: Send + Sync {
    async fn validate(&self, config_path: &Path) -> std::result::Result<(), String>;
    async fn reload(&self) -> std::result::Result<(), String>;
}

/// Drives a real nginx via its CLI.
pub struct NginxProcess {
    binary: String,
    reload_timeout: Duration,
}

impl NginxProcess {
    pub fn new(binary: &str, reload_timeout: Duration) -> Self {
        NginxProcess {
            binary: binary.to_string(),
            reload_timeout,
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> std::result::Result<(), String> {
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(&self.binary).args(args).output(),
        )
        .await
        .map_err(|_| format!("{} {} timed out", self.binary, args.join(" ")))?
        .map_err(|e| format!("spawn {}: {e}", self.binary))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl ProxyProcess for NginxProcess {
    async fn validate(&self, config_path: &Path) -> std::result::Result<(), String> {
        self.run(
            &["-t", "-c", &config_path.display().to_string()],
            Duration::from_secs(10),
        )
        .await
    }

    async fn reload(&self) -> std::result::Result<(), String> {
        self.run(&["-s", "reload"], self.reload_timeout).await
    }
}

/// Applier for deployments without a proxy: configs render and hashes
/// track, but no process is touched.
pub struct NoopProcess;

#[async_trait]
impl ProxyProcess for NoopProcess {
    async fn validate(&self, _config_path: &Path) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn reload(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub enabled: bool,
    pub degraded: bool,
    pub last_applied_hash: Option<String>,
    pub active_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub hash: String,
    /// `false` when the rendered config matched the applied hash (no-op).
    pub changed: bool,
}

#[derive(Default)]
struct State {
    last_applied_hash: Option<String>,
    degraded: bool,
}

pub struct ProxyReconciler {
    store: Arc<Store>,
    process: Box<dyn ProxyProcess>,
    dir: PathBuf,
    certs_dir: PathBuf,
    challenges_dir: PathBuf,
    enabled: bool,
    debounce: Duration,
    state: Mutex<State>,
    /// Serializes appliers; the config file has a single writer.
    apply_lock: tokio::sync::Mutex<()>,
    trigger_tx: mpsc::Sender<()>,
}

impl ProxyReconciler {
    pub fn new(
        store: Arc<Store>,
        config: &Config,
        process: Box<dyn ProxyProcess>,
    ) -> (Arc<ProxyReconciler>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        let reconciler = Arc::new(ProxyReconciler {
            store,
            process,
            dir: config.proxy_dir(),
            certs_dir: config.certs_dir(),
            challenges_dir: config.challenges_dir(),
            enabled: config.nginx.enabled,
            debounce: Duration::from_millis(config.nginx.debounce_ms),
            state: Mutex::new(State::default()),
            apply_lock: tokio::sync::Mutex::new(()),
            trigger_tx,
        });
        (reconciler, trigger_rx)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join("active.conf")
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join("staging.conf")
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join("active.conf.backup")
    }

    /// Nudge the reconciler. Triggers within the debounce window coalesce
    /// into a single reconciliation.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    pub fn status(&self) -> ProxyStatus {
        let state = self.state.lock();
        ProxyStatus {
            enabled: self.enabled,
            degraded: state.degraded,
            last_applied_hash: state.last_applied_hash.clone(),
            active_path: self.active_path(),
        }
    }

    pub async fn active_config(&self) -> Result<String> {
        tokio::fs::read_to_string(self.active_path())
            .await
            .map_err(|e| Error::NotFound(format!("active proxy config: {e}")))
    }

    /// Validate the current snapshot without applying.
    pub async fn validate_only(&self) -> Result<String> {
        let snapshot = self.store.route_snapshot().await?;
        let config = render_config(&snapshot, &self.certs_dir, &self.challenges_dir);
        let hash = config_hash(&config);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(ProxyError::from)?;
        let staging = self.staging_path();
        tokio::fs::write(&staging, &config)
            .await
            .map_err(ProxyError::from)?;
        self.process
            .validate(&staging)
            .await
            .map_err(|msg| Error::from(ProxyError::Invalid(msg)))?;
        Ok(hash)
    }

    /// Debounced trigger loop.
    pub async fn run(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                trigger = trigger_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
            }

            // Debounce: coalesce the burst that follows a cascade.
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.debounce) => {}
            }
            while trigger_rx.try_recv().is_ok() {}

            let actor = Actor::system();
            if let Err(err) = self.reconcile_now(&actor).await {
                tracing::warn!(error = %err, "proxy reconciliation failed");
            }
        }
    }

    /// Render → no-op check → stage → validate → backup → swap → reload,
    /// rolling back on any failure past the swap.
    pub async fn reconcile_now(&self, actor: &Actor) -> Result<ReconcileOutcome> {
        let _guard = self.apply_lock.lock().await;

        let snapshot = self.store.route_snapshot().await?;
        let config = render_config(&snapshot, &self.certs_dir, &self.challenges_dir);
        let hash = config_hash(&config);

        if self.state.lock().last_applied_hash.as_deref() == Some(hash.as_str()) {
            return Ok(ReconcileOutcome {
                hash,
                changed: false,
            });
        }

        if !self.enabled {
            // Track-only mode: route CRUD still validates and hashes move,
            // but no process is driven.
            self.state.lock().last_applied_hash = Some(hash.clone());
            return Ok(ReconcileOutcome {
                hash,
                changed: true,
            });
        }

        let result = self.apply(&config, &hash).await;
        let status = if result.is_ok() { "ok" } else { "failed" };
        let _ = self
            .store
            .audit_record(
                actor,
                "nginx.reload",
                "nginx",
                serde_json::json!({"status": status, "hash": hash}),
            )
            .await;

        result?;
        Ok(ReconcileOutcome {
            hash,
            changed: true,
        })
    }

    async fn apply(&self, config: &str, hash: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(ProxyError::from)?;

        let staging = self.staging_path();
        let active = self.active_path();
        let backup = self.backup_path();

        tokio::fs::write(&staging, config)
            .await
            .map_err(ProxyError::from)?;

        if let Err(msg) = self.process.validate(&staging).await {
            tracing::warn!(hash, error = %msg, "staging config rejected by validator");
            return Err(ProxyError::Invalid(msg).into());
        }

        // Backup before the swap so rollback can never lose the prior
        // config.
        let had_active = tokio::fs::try_exists(&active).await.unwrap_or(false);
        if had_active {
            tokio::fs::copy(&active, &backup)
                .await
                .map_err(ProxyError::from)?;
        }

        tokio::fs::rename(&staging, &active)
            .await
            .map_err(ProxyError::from)?;

        match self.process.reload().await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.last_applied_hash = Some(hash.to_string());
                state.degraded = false;
                tracing::info!(hash, "proxy config applied");
                Ok(())
            }
            Err(reload_err) => {
                tracing::warn!(error = %reload_err, "proxy reload failed; rolling back");
                if had_active {
                    let restore = async {
                        tokio::fs::copy(&backup, &active).await.map_err(|e| e.to_string())?;
                        self.process.reload().await
                    };
                    if let Err(restore_err) = restore.await {
                        self.state.lock().degraded = true;
                        tracing::error!(
                            error = %restore_err,
                            "rollback failed; proxy degraded, serving last-known-good config"
                        );
                        return Err(ProxyError::Degraded(restore_err).into());
                    }
                }
                Err(ProxyError::Reload(reload_err).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PortMap, RouteSpec, ServiceSpec};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubProcess {
        validate_ok: AtomicBool,
        reload_ok: AtomicBool,
        validations: AtomicUsize,
        reloads: AtomicUsize,
    }

    impl StubProcess {
        fn new() -> Arc<StubProcess> {
            Arc::new(StubProcess {
                validate_ok: AtomicBool::new(true),
                reload_ok: AtomicBool::new(true),
                validations: AtomicUsize::new(0),
                reloads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProxyProcess for Arc<StubProcess> {
        async fn validate(&self, _path: &Path) -> std::result::Result<(), String> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            if self.validate_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("unexpected directive".to_string())
            }
        }

        async fn reload(&self) -> std::result::Result<(), String> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.reload_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("reload signal refused".to_string())
            }
        }
    }

    async fn rig(enabled: bool) -> (Arc<Store>, Arc<ProxyReconciler>, Arc<StubProcess>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().await.unwrap());
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.nginx.enabled = enabled;
        let process = StubProcess::new();
        let (reconciler, _rx) =
            ProxyReconciler::new(Arc::clone(&store), &config, Box::new(Arc::clone(&process)));
        (store, reconciler, process, dir)
    }

    async fn seed_route(store: &Store, domain: &str) {
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
        store
            .create_route(
                &mut tx,
                service.id,
                &RouteSpec {
                    domain: domain.to_string(),
                    path: None,
                    port: 80,
                    tls: false,
                    certificate_id: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn apply_writes_active_and_records_hash() {
        let (store, reconciler, process, _dir) = rig(true).await;
        seed_route(&store, "demo.local").await;

        let outcome = reconciler.reconcile_now(&Actor::system()).await.unwrap();
        assert!(outcome.changed);

        let active = tokio::fs::read_to_string(reconciler.active_path())
            .await
            .unwrap();
        assert!(active.contains("server_name demo.local;"));
        assert_eq!(
            reconciler.status().last_applied_hash,
            Some(outcome.hash.clone())
        );
        assert_eq!(process.reloads.load(Ordering::SeqCst), 1);

        // Unchanged snapshot: no-op, no second validate/reload.
        let repeat = reconciler.reconcile_now(&Actor::system()).await.unwrap();
        assert!(!repeat.changed);
        assert_eq!(process.validations.load(Ordering::SeqCst), 1);
        assert_eq!(process.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_failure_keeps_active_config() {
        let (store, reconciler, process, _dir) = rig(true).await;
        seed_route(&store, "demo.local").await;
        let first = reconciler.reconcile_now(&Actor::system()).await.unwrap();
        let active_before = tokio::fs::read_to_string(reconciler.active_path())
            .await
            .unwrap();

        // New route renders a new config, but the validator now rejects.
        seed_extra_route(&store, "other.local").await;
        process.validate_ok.store(false, Ordering::SeqCst);

        let err = reconciler.reconcile_now(&Actor::system()).await.unwrap_err();
        assert_eq!(err.kind(), "proxy_invalid");

        let active_after = tokio::fs::read_to_string(reconciler.active_path())
            .await
            .unwrap();
        assert_eq!(active_before, active_after);
        assert_eq!(
            reconciler.status().last_applied_hash,
            Some(first.hash),
            "failed validation must not advance the applied hash"
        );

        // The failure is recorded in the audit log.
        let entries = store.audit_recent(10).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.action == "nginx.reload" && e.metadata.contains("failed")));
    }

    async fn seed_extra_route(store: &Store, domain: &str) {
        let project = store.get_project_by_name("demo").await.unwrap();
        let services = store.list_services(project.id).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        store
            .create_route(
                &mut tx,
                services[0].id,
                &RouteSpec {
                    domain: domain.to_string(),
                    path: None,
                    port: 80,
                    tls: false,
                    certificate_id: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn reload_failure_rolls_back_to_backup() {
        let (store, reconciler, process, _dir) = rig(true).await;
        seed_route(&store, "demo.local").await;
        reconciler.reconcile_now(&Actor::system()).await.unwrap();
        let good = tokio::fs::read_to_string(reconciler.active_path())
            .await
            .unwrap();

        seed_extra_route(&store, "other.local").await;
        process.reload_ok.store(false, Ordering::SeqCst);

        let err = reconciler.reconcile_now(&Actor::system()).await.unwrap_err();
        // Rollback itself re-signals reload, which also fails: degraded.
        assert_eq!(err.kind(), "internal");
        assert!(reconciler.status().degraded);

        // The backup restore still put the old bytes back.
        let active = tokio::fs::read_to_string(reconciler.active_path())
            .await
            .unwrap();
        assert_eq!(active, good);
    }

    #[tokio::test]
    async fn disabled_mode_tracks_hashes_without_process() {
        let (store, reconciler, process, _dir) = rig(false).await;
        seed_route(&store, "demo.local").await;

        let outcome = reconciler.reconcile_now(&Actor::system()).await.unwrap();
        assert!(outcome.changed);
        assert!(reconciler.status().last_applied_hash.is_some());
        assert_eq!(process.validations.load(Ordering::SeqCst), 0);
        assert_eq!(process.reloads.load(Ordering::SeqCst), 0);
    }
}
