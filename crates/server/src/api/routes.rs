use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use glinr_kernel::store::{Route, RouteSpec};
use glinr_kernel::Role;

use crate::auth::{require_role, CurrentActor};
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Route>>> {
    Ok(Json(state.kernel.store.list_all_routes().await?))
}

pub async fn list_for_service(
    State(state): State<AppState>,
    Path(service_id): Path<i64>,
) -> ApiResult<Json<Vec<Route>>> {
    state.kernel.store.get_service(service_id).await?;
    Ok(Json(state.kernel.store.list_routes(service_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(service_id): Path<i64>,
    Json(spec): Json<RouteSpec>,
) -> ApiResult<Json<Route>> {
    require_role(&actor, Role::Deployer)?;
    let route = state.kernel.create_route(&actor, service_id, &spec).await?;
    Ok(Json(route))
}

pub async fn detail(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Route>> {
    Ok(Json(state.kernel.store.get_route(id).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Deployer)?;
    state.kernel.delete_route(&actor, id).await?;
    Ok(Json(json!({"deleted": id})))
}
