mod api;
mod auth;
mod error;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use glinr_kernel::certs::{CertManager, CertbotIssuer, KeyCipher};
use glinr_kernel::engine::{ContainerEngine, DockerEngine};
use glinr_kernel::events::{EventBus, EventPump, StatusCache, StreamHub};
use glinr_kernel::health::HealthProber;
use glinr_kernel::jobs::JobQueue;
use glinr_kernel::lifecycle::LifecycleManager;
use glinr_kernel::proxy::{NginxProcess, NoopProcess, ProxyProcess, ProxyReconciler};
use glinr_kernel::store::Store;
use glinr_kernel::supervisor::Supervisor;
use glinr_kernel::{Config, Kernel};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Phase 1: basic tracing so config loading can log. Replaced by the
    // configured subscriber once the log level is known.
    let basic_tracing = init_tracing_basic();

    info!("Starting glinrdockd v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("configuration validation failed")?;

    drop(basic_tracing);
    init_tracing_from_config(&config);

    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .context("create data directory")?;

    let supervisor = Arc::new(Supervisor::new());
    let shutdown = supervisor.shutdown_token();

    let store = Arc::new(
        Store::open(&config.db_path())
            .await
            .context("open database")?,
    );
    info!(fts = store.fts_enabled(), "database ready");

    let cipher =
        KeyCipher::load_or_create(&config.secret_key_path()).context("load secret key")?;

    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect(&config.docker_socket).context("connect to container engine")?,
    );
    match engine.ping().await {
        Ok(()) => info!("container engine reachable"),
        Err(e) => warn!(error = %e, "container engine not reachable yet; will reconnect"),
    }

    let bus = Arc::new(EventBus::new());
    let cache = Arc::new(StatusCache::new());

    // The pump flips this on (re)connect; lifecycle commands block on it
    // while the engine stream is down.
    let (engine_up_tx, engine_up_rx) = watch::channel(false);

    let machine = LifecycleManager::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&supervisor),
        &config,
        engine_up_rx,
    );

    let pump = EventPump::new(
        Arc::clone(&engine),
        Arc::clone(&bus),
        Arc::clone(&cache),
        Arc::clone(&machine),
        engine_up_tx,
        shutdown.clone(),
    );
    tokio::spawn(pump.run());

    let prober = Arc::new(HealthProber::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        &config,
        shutdown.clone(),
    ));
    tokio::spawn(Arc::clone(&prober).run());

    let process: Box<dyn ProxyProcess> = if config.nginx.enabled {
        Box::new(NginxProcess::new(
            &config.nginx.binary,
            Duration::from_secs(config.nginx.reload_timeout_secs),
        ))
    } else {
        Box::new(NoopProcess)
    };
    let (reconciler, trigger_rx) = ProxyReconciler::new(Arc::clone(&store), &config, process);
    tokio::spawn(Arc::clone(&reconciler).run(trigger_rx, shutdown.clone()));

    let certs = Arc::new(CertManager::new(Arc::clone(&store), cipher, &config));
    certs.ensure_dirs().await.context("create cert directories")?;

    let jobs = JobQueue::new(Arc::clone(&bus), shutdown.clone());
    let streams = StreamHub::new(Arc::clone(&engine), Arc::clone(&bus), shutdown.clone());

    let kernel = Arc::new(Kernel {
        config: config.clone(),
        store,
        engine,
        machine,
        bus,
        cache,
        supervisor: Arc::clone(&supervisor),
        prober,
        reconciler,
        certs,
        jobs,
        streams,
    });

    kernel
        .bootstrap_admin()
        .await
        .context("bootstrap admin token")?;

    // Re-materialize certificate files and converge the proxy against
    // whatever intent survived the restart.
    match kernel.store.list_certificates().await {
        Ok(certificates) => {
            for cert in certificates {
                if let Err(e) = kernel.certs.materialize(&cert).await {
                    warn!(domain = %cert.domain, error = %e, "failed to materialize certificate");
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to list certificates at boot"),
    }
    kernel.reconciler.trigger();

    if config.nginx.enabled {
        let issuer = Arc::new(CertbotIssuer::new(&config));
        tokio::spawn(Arc::clone(&kernel).run_cert_renewal_loop(issuer));
        info!("certificate renewal scheduler started");
    }

    let app = api::build_router(AppState::new(Arc::clone(&kernel)));
    let addr: SocketAddr = config.http_addr.parse().context("parse http_addr")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind control API")?;

    info!("glinrdockd is ready");
    info!("  - control API: http://{addr}/v1");
    info!("  - health:      http://{addr}/v1/health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&supervisor)))
        .await
        .context("server error")?;

    // Ordered teardown: intake already stopped; drain jobs, close the
    // fan-out, then the store.
    kernel.jobs.drain(Duration::from_secs(10)).await;
    kernel.bus.close();
    kernel.store.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM, or a supervisor-initiated shutdown
/// (emergency restart).
async fn shutdown_signal(supervisor: Arc<Supervisor>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let supervisor_shutdown = supervisor.shutdown_token();
    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C, shutting down"),
        _ = terminate => warn!("received SIGTERM, shutting down"),
        _ = supervisor_shutdown.cancelled() => warn!("supervisor requested shutdown"),
    }
    supervisor.begin_shutdown();
}

fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,glinr_kernel=debug"));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn init_tracing_from_config(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
