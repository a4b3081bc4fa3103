use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use glinr_kernel::engine::ContainerSummary;
use glinr_kernel::jobs::JobRecord;
use glinr_kernel::proxy::ProxyStatus;
use glinr_kernel::{Error, Role};

use crate::auth::{require_role, CurrentActor};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ── Public surface ──────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.kernel.supervisor.uptime_secs(),
    }))
}

pub async fn system_info(State(state): State<AppState>) -> Json<Value> {
    let engine_ok = state.kernel.engine.ping().await.is_ok();
    let managed = if engine_ok {
        state
            .kernel
            .engine
            .list_managed()
            .await
            .map(|c| c.len())
            .unwrap_or(0)
    } else {
        0
    };

    Json(json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "engine": {
            "reachable": engine_ok,
            "managed_containers": managed,
        },
        "lockdown": state.kernel.supervisor.current_lockdown(),
        "started_at": state.kernel.supervisor.started_at(),
        "data_dir": state.kernel.config.data_dir,
        "proxy_enabled": state.kernel.config.nginx.enabled,
    }))
}

// ── Proxy operations ────────────────────────────────────────────

pub async fn nginx_reload(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    let outcome = state.kernel.proxy_reload(&actor).await?;
    Ok(Json(json!({
        "hash": outcome.hash,
        "changed": outcome.changed,
    })))
}

pub async fn nginx_validate(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    let hash = state.kernel.proxy_validate().await?;
    Ok(Json(json!({"valid": true, "hash": hash})))
}

pub async fn nginx_status(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<ProxyStatus>> {
    require_role(&actor, Role::Admin)?;
    Ok(Json(state.kernel.proxy_status()))
}

pub async fn nginx_config(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<String> {
    require_role(&actor, Role::Admin)?;
    Ok(state.kernel.reconciler.active_config().await?)
}

// ── Supervisor operations ───────────────────────────────────────

#[derive(Deserialize)]
pub struct LockdownRequest {
    pub reason: Option<String>,
}

pub async fn lockdown(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<LockdownRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    let reason = body.reason.unwrap_or_else(|| "operator lockdown".to_string());
    let lockdown = state.kernel.lockdown(&actor, &reason).await?;
    Ok(Json(json!({"lockdown": lockdown})))
}

pub async fn lift_lockdown(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    state.kernel.lift_lockdown(&actor).await?;
    Ok(Json(json!({"lockdown": Value::Null})))
}

pub async fn emergency_restart(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    let at = state.kernel.emergency_restart(&actor).await?;
    Ok(Json(json!({"restart_requested_at": at})))
}

// ── Discovery & jobs ────────────────────────────────────────────

pub async fn unmanaged_containers(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<ContainerSummary>>> {
    require_role(&actor, Role::Deployer)?;
    Ok(Json(state.kernel.discover_unmanaged().await?))
}

pub async fn jobs_list(State(state): State<AppState>) -> ApiResult<Json<Vec<JobRecord>>> {
    Ok(Json(state.kernel.jobs.list()))
}

pub async fn job_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobRecord>> {
    state
        .kernel
        .jobs
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("job {id}"))))
}
