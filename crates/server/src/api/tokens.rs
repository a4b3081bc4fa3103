use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use glinr_kernel::store::Token;
use glinr_kernel::{Error, Role};

use crate::auth::{require_role, CurrentActor};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<Token>>> {
    require_role(&actor, Role::Admin)?;
    Ok(Json(state.kernel.store.list_tokens().await?))
}

#[derive(Deserialize)]
pub struct CreateToken {
    pub name: String,
    /// Accepted here and never persisted; only the hash is stored.
    pub secret: String,
    pub role: String,
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<CreateToken>,
) -> ApiResult<Json<Token>> {
    require_role(&actor, Role::Admin)?;
    if body.secret.len() < 8 {
        return Err(ApiError(Error::Validation(
            "token secret must be at least 8 characters".into(),
        )));
    }
    let role = Role::parse(&body.role)
        .ok_or_else(|| ApiError(Error::Validation(format!("unknown role {:?}", body.role))))?;
    let token = state
        .kernel
        .create_token(&actor, &body.name, &body.secret, role)
        .await?;
    Ok(Json(token))
}

pub async fn remove(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    if name == actor.name {
        return Err(ApiError(Error::Conflict(
            "cannot delete the token used for this request".into(),
        )));
    }
    state.kernel.delete_token(&actor, &name).await?;
    Ok(Json(json!({"deleted": name})))
}
