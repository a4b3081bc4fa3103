//! `/v1` control surface: route table, auth layering, and shared
//! middleware. Handlers live in per-resource modules and stay thin —
//! validation and semantics belong to the kernel.

pub mod certs;
pub mod projects;
pub mod routes;
pub mod search;
pub mod services;
pub mod system;
pub mod tokens;

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method, StatusCode};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/v1/health", get(system::health))
        .route("/v1/system", get(system::system_info));

    let protected = Router::new()
        // Tokens
        .route("/v1/tokens", get(tokens::list).post(tokens::create))
        .route("/v1/tokens/{name}", delete(tokens::remove))
        // Projects
        .route("/v1/projects", get(projects::list).post(projects::create))
        .route(
            "/v1/projects/{id}",
            get(projects::detail).delete(projects::remove),
        )
        .route(
            "/v1/projects/{id}/services",
            get(services::list_for_project).post(services::create),
        )
        // Services
        .route(
            "/v1/services/{id}",
            get(services::detail).delete(services::remove),
        )
        .route("/v1/services/{id}/start", post(services::start))
        .route("/v1/services/{id}/stop", post(services::stop))
        .route("/v1/services/{id}/restart", post(services::restart))
        .route("/v1/services/{id}/unlock", post(services::unlock))
        .route("/v1/services/{id}/adopt", post(services::adopt))
        .route("/v1/services/{id}/logs", get(services::logs_ws))
        .route("/v1/services/{id}/logs/tail", get(services::logs_tail))
        .route("/v1/services/{id}/stats", get(services::stats_ws))
        .route(
            "/v1/services/{id}/health-check/run",
            post(services::run_health_check),
        )
        .route(
            "/v1/services/{id}/routes",
            get(routes::list_for_service).post(routes::create),
        )
        // Routes
        .route("/v1/routes", get(routes::list))
        .route("/v1/routes/{id}", get(routes::detail).delete(routes::remove))
        // Certificates
        .route("/v1/certificates", get(certs::list).post(certs::create))
        .route(
            "/v1/certificates/{id}",
            get(certs::detail).delete(certs::remove),
        )
        // Proxy
        .route("/v1/nginx/reload", post(system::nginx_reload))
        .route("/v1/nginx/validate", post(system::nginx_validate))
        .route("/v1/nginx/status", get(system::nginx_status))
        .route("/v1/nginx/config", get(system::nginx_config))
        // Search
        .route("/v1/search", get(search::query))
        .route("/v1/search/suggest", get(search::suggest))
        .route("/v1/search/reindex", post(search::reindex))
        // Jobs
        .route("/v1/jobs", get(system::jobs_list))
        .route("/v1/jobs/{id}", get(system::job_detail))
        // Supervisor
        .route("/v1/system/lockdown", post(system::lockdown))
        .route("/v1/system/lift-lockdown", post(system::lift_lockdown))
        .route(
            "/v1/system/emergency-restart",
            post(system::emergency_restart),
        )
        .route("/v1/system/containers", get(system::unmanaged_containers))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let cors = if state.kernel.config.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins = state
            .kernel
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse::<axum::http::HeaderValue>().ok())
            .collect::<Vec<_>>();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    };

    Router::new().merge(public).merge(protected).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(30),
            ))
            .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
            .layer(cors),
    )
    .with_state(state)
}
