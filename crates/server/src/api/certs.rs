use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use glinr_kernel::ops::CertificateDetail;
use glinr_kernel::store::CertType;
use glinr_kernel::{Error, Role};

use crate::auth::{require_role, CurrentActor};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<CertificateDetail>>> {
    require_role(&actor, Role::Admin)?;
    Ok(Json(state.kernel.list_certificates().await?))
}

#[derive(Deserialize)]
pub struct UploadCertificate {
    pub domain: String,
    #[serde(default = "default_type")]
    pub r#type: String,
    pub cert_pem: String,
    /// Accepted on upload, encrypted immediately, never returned.
    pub key_pem: String,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_renew: bool,
}

fn default_type() -> String {
    "manual".to_string()
}

pub async fn create(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<UploadCertificate>,
) -> ApiResult<Json<CertificateDetail>> {
    require_role(&actor, Role::Admin)?;
    let cert_type = CertType::parse(&body.r#type)
        .ok_or_else(|| ApiError(Error::Validation(format!("unknown type {:?}", body.r#type))))?;
    let detail = state
        .kernel
        .upload_certificate(
            &actor,
            &body.domain,
            cert_type,
            &body.cert_pem,
            &body.key_pem,
            body.expires_at,
            body.auto_renew,
        )
        .await?;
    Ok(Json(detail))
}

pub async fn detail(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<CertificateDetail>> {
    require_role(&actor, Role::Admin)?;
    Ok(Json(state.kernel.certificate_detail(id).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    require_role(&actor, Role::Admin)?;
    state.kernel.delete_certificate(&actor, id).await?;
    Ok(Json(json!({"deleted": id})))
}
