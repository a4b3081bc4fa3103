use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use futures_util::SinkExt;
use serde::Deserialize;
use serde_json::{json, Value};

use glinr_kernel::engine::{logs::clamp_tail, LogLine, LogSource};
use glinr_kernel::events::Delivery;
use glinr_kernel::lifecycle::Command;
use glinr_kernel::store::{Service, ServiceSpec};
use glinr_kernel::{Error, Role};

use crate::auth::{require_role, CurrentActor};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_for_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<Vec<Service>>> {
    state.kernel.store.get_project(project_id).await?;
    Ok(Json(state.kernel.store.list_services(project_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(project_id): Path<i64>,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<Json<Service>> {
    require_role(&actor, Role::Deployer)?;
    let service = state.kernel.create_service(&actor, project_id, &spec).await?;
    Ok(Json(service))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<glinr_kernel::ops::ServiceDetail>> {
    Ok(Json(state.kernel.service_detail(id).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Deployer)?;
    state.kernel.delete_service(&actor, id).await?;
    Ok(Json(json!({"deleted": id})))
}

// ── Lifecycle commands ──────────────────────────────────────────

async fn lifecycle(
    state: AppState,
    actor: glinr_kernel::Actor,
    id: i64,
    command: Command,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Deployer)?;
    let result = state.kernel.lifecycle(&actor, id, command).await?;
    Ok(Json(json!({"status": result})))
}

pub async fn start(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    lifecycle(state, actor, id, Command::Start).await
}

pub async fn stop(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    lifecycle(state, actor, id, Command::Stop).await
}

pub async fn restart(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    lifecycle(state, actor, id, Command::Restart).await
}

pub async fn unlock(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    lifecycle(state, actor, id, Command::Unlock).await
}

#[derive(Deserialize)]
pub struct AdoptRequest {
    pub container_id: String,
}

pub async fn adopt(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
    Json(body): Json<AdoptRequest>,
) -> ApiResult<Json<Service>> {
    require_role(&actor, Role::Deployer)?;
    let service = state
        .kernel
        .adopt_container(&actor, id, &body.container_id)
        .await?;
    Ok(Json(service))
}

pub async fn run_health_check(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let verdict = state.kernel.probe_service(&actor, id).await?;
    Ok(Json(json!({"health_status": verdict})))
}

// ── Logs & stats ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TailParams {
    pub tail: Option<u32>,
}

pub async fn logs_tail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<TailParams>,
) -> ApiResult<Json<Vec<Value>>> {
    let service = state.kernel.store.get_service(id).await?;
    let Some(container_id) = service.container_id else {
        return Ok(Json(vec![]));
    };
    let tail = clamp_tail(params.tail);
    let lines = state.kernel.engine.log_tail(&container_id, tail).await?;
    Ok(Json(lines.iter().map(log_line_json).collect()))
}

fn log_line_json(line: &LogLine) -> Value {
    json!({
        "timestamp": line.timestamp,
        "source": match line.source {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        },
        "line": String::from_utf8_lossy(&line.content),
    })
}

pub async fn logs_ws(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let service = state.kernel.store.get_service(id).await?;
    let container_id = service
        .container_id
        .ok_or_else(|| ApiError(Error::Conflict("service has no container".into())))?;
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, state, id, container_id)))
}

async fn stream_logs(mut socket: WebSocket, state: AppState, service_id: i64, container_id: String) {
    let mut subscription = state.kernel.streams.subscribe_logs(service_id, &container_id);
    while let Some(delivery) = subscription.recv().await {
        let frame = match delivery {
            Delivery::Item(line) => log_line_json(&line),
            // Ring overflow: the client observes exactly what it missed.
            Delivery::Gap(n) => json!({"gap": n}),
        };
        if socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = socket.close().await;
}

pub async fn stats_ws(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let service = state.kernel.store.get_service(id).await?;
    let container_id = service
        .container_id
        .ok_or_else(|| ApiError(Error::Conflict("service has no container".into())))?;
    Ok(ws.on_upgrade(move |socket| stream_stats(socket, state, id, container_id)))
}

async fn stream_stats(mut socket: WebSocket, state: AppState, service_id: i64, container_id: String) {
    let mut subscription = state
        .kernel
        .streams
        .subscribe_stats(service_id, &container_id);
    while let Some(delivery) = subscription.recv().await {
        let frame = match delivery {
            Delivery::Item(sample) => {
                serde_json::to_value(&sample).unwrap_or_else(|_| json!({}))
            }
            Delivery::Gap(n) => json!({"gap": n}),
        };
        if socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = socket.close().await;
}
