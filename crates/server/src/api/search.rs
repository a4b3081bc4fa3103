use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use glinr_kernel::jobs::JobRecord;
use glinr_kernel::store::SearchHit;
use glinr_kernel::Role;

use crate::auth::{require_role, CurrentActor};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub limit: Option<i64>,
}

pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let hits: Vec<SearchHit> = state
        .kernel
        .search(&params.q, params.limit.unwrap_or(20))
        .await?;
    Ok(Json(json!({
        "hits": hits,
        "fts": state.kernel.store.fts_enabled(),
    })))
}

pub async fn suggest(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(
        state
            .kernel
            .suggest(&params.q, params.limit.unwrap_or(10))
            .await?,
    ))
}

pub async fn reindex(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<JobRecord>> {
    require_role(&actor, Role::Admin)?;
    Ok(Json(state.kernel.submit_reindex(&actor).await?))
}
