use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use glinr_kernel::store::Project;
use glinr_kernel::Role;

use crate::auth::{require_role, CurrentActor};
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.kernel.store.list_projects().await?))
}

#[derive(Deserialize)]
pub struct CreateProject {
    pub name: String,
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<CreateProject>,
) -> ApiResult<Json<Project>> {
    require_role(&actor, Role::Deployer)?;
    let project = state.kernel.create_project(&actor, &body.name).await?;
    Ok(Json(project))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let project = state.kernel.store.get_project(id).await?;
    let services = state.kernel.store.list_services(id).await?;
    Ok(Json(json!({
        "id": project.id,
        "name": project.name,
        "network_name": project.network_name(),
        "service_count": services.len(),
        "created_at": project.created_at,
    })))
}

#[derive(Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Deployer)?;
    state.kernel.delete_project(&actor, id, params.force).await?;
    Ok(Json(json!({"deleted": id})))
}
