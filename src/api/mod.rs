//! Stateless HTTP surface. Handlers translate requests into store and
//! scheduler operations; the worker pool and store own all lifecycle
//! state.

pub mod dashboard;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{self, AuthPrincipal};
use crate::config::ServerConfig;
use crate::error::GridqError;
use crate::quota::{EndpointGuard, RateLimiter};
use crate::scanner::ArtifactScanner;
use crate::scheduler::Scheduler;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Scheduler,
    pub submissions: Arc<RateLimiter>,
    pub endpoint_guard: Arc<EndpointGuard>,
    pub scanner: Option<Arc<dyn ArtifactScanner>>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        config: Arc<ServerConfig>,
        scanner: Option<Arc<dyn ArtifactScanner>>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone()),
            submissions: Arc::new(RateLimiter::new(
                config.submit_rate_per_minute,
                Duration::from_secs(60),
            )),
            endpoint_guard: Arc::new(EndpointGuard::new()),
            scanner,
            store,
            config,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/submit", post(handlers::submit))
        .route("/status/:job_id", get(handlers::status))
        .route("/results/:job_id", get(handlers::results))
        .route("/cancel/:job_id", post(handlers::cancel))
        .route("/jobs", get(handlers::list_jobs))
        .route("/nodes", get(handlers::nodes))
        .route("/dashboard", get(dashboard::dashboard))
        .layer(cors)
        .with_state(state)
}

impl IntoResponse for GridqError {
    fn into_response(self) -> Response {
        let status = match &self {
            GridqError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GridqError::PrincipalMismatch(_) | GridqError::Forbidden(_) => StatusCode::FORBIDDEN,
            GridqError::NotFound(_) => StatusCode::NOT_FOUND,
            GridqError::TerminalState(_)
            | GridqError::Validation(_)
            | GridqError::ScannerReject(_) => StatusCode::BAD_REQUEST,
            GridqError::RateLimited { .. } | GridqError::ConcurrencyLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GridqError::Transport(_) | GridqError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut body = json!({
            "error": self.kind(),
            "detail": self.to_string(),
        });
        if let GridqError::RateLimited { retry_after } = &self {
            body["retry_after"] = json!(retry_after);
        }
        (status, Json(body)).into_response()
    }
}

/// Extract the secret from an `Authorization: Bearer <secret>` header.
pub(crate) fn bearer_secret(headers: &HeaderMap) -> Result<&str, GridqError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| GridqError::Unauthenticated("authorization header required".to_string()))?
        .to_str()
        .map_err(|_| GridqError::Unauthenticated("malformed authorization header".to_string()))?;
    raw.strip_prefix("Bearer ")
        .ok_or_else(|| GridqError::Unauthenticated("expected bearer credential".to_string()))
}

pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthPrincipal, GridqError> {
    let secret = bearer_secret(headers)?;
    auth::validate_secret(&state.store, secret)
}
