//! Bearer-token authentication middleware and role gates.
//!
//! The verified [`Actor`] travels in request extensions as an explicit
//! value; handlers pull it with the [`CurrentActor`] extractor and gate
//! on role where the route demands more than `viewer`.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use glinr_kernel::{Actor, Error, Role};

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticate the bearer credential and attach the actor.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers().get(header::AUTHORIZATION))
        .ok_or(Error::Unauthorized)?;
    let actor = state.kernel.authenticate(&token).await?;
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

fn bearer_token(value: Option<&header::HeaderValue>) -> Option<String> {
    let value = value?.to_str().ok()?;
    let rest = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Extractor for the authenticated actor placed by [`require_auth`].
pub struct CurrentActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for CurrentActor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .cloned()
            .map(CurrentActor)
            .ok_or_else(|| ApiError(Error::Unauthorized))
    }
}

/// Reject callers below the required role.
pub fn require_role(actor: &Actor, required: Role) -> Result<(), ApiError> {
    if actor.can(required) {
        Ok(())
    } else {
        Err(ApiError(Error::Forbidden(format!(
            "requires {} role",
            required.as_str()
        ))))
    }
}
