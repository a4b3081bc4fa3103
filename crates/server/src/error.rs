//! Kernel error kinds map to HTTP status codes in exactly one place.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError(pub glinr_kernel::Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl<E> From<E> for ApiError
where
    E: Into<glinr_kernel::Error>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" | "crash_looping" | "busy" | "superseded" => StatusCode::CONFLICT,
        "validation" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" | "quota_exceeded" => StatusCode::FORBIDDEN,
        "locked_down" | "engine_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "cancelled" => StatusCode::REQUEST_TIMEOUT,
        "image_pull_failed" | "port_conflict" => StatusCode::BAD_GATEWAY,
        // engine_error, proxy_invalid, internal
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);

        // Full detail lands in the log; 5xx bodies stay generic so
        // backend internals never leak to clients.
        let message = if status.is_server_error() {
            tracing::error!(kind, error = %self.0, "request failed");
            match kind {
                "engine_unavailable" => "container engine unavailable".to_string(),
                "proxy_invalid" => self.0.to_string(),
                _ => "an internal error occurred".to_string(),
            }
        } else {
            self.0.to_string()
        };

        let body = Json(json!({
            "error": kind,
            "message": message,
        }));

        if kind == "locked_down" {
            return (status, [(header::RETRY_AFTER, "30")], body).into_response();
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glinr_kernel::Error;

    #[test]
    fn kind_to_status_mapping() {
        assert_eq!(status_for(Error::NotFound("x".into()).kind()), StatusCode::NOT_FOUND);
        assert_eq!(status_for(Error::CrashLooping.kind()), StatusCode::CONFLICT);
        assert_eq!(
            status_for(Error::LockedDown("m".into()).kind()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(Error::Unauthorized.kind()), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(Error::Validation("v".into()).kind()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(Error::Internal("i".into()).kind()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn locked_down_carries_retry_after() {
        let response = ApiError(Error::LockedDown("maintenance".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "30"
        );
    }
}
