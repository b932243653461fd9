use crate::server::service::handler::VerveService;
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use verve_core::Result;

pub const ACCEPT_PATH: &str = "/api/verve/accept";
pub const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Deserialize)]
pub struct AcceptParams {
    pub id: Option<String>,
    pub endpoint: Option<String>,
}

/// Builds the HTTP surface over a running service.
pub fn router(service: VerveService) -> Router {
    Router::new()
        .route(ACCEPT_PATH, get(accept))
        .route(HEALTH_PATH, get(health))
        .with_state(service)
}

async fn accept(
    State(service): State<VerveService>,
    Query(params): Query<AcceptParams>,
) -> Result<&'static str> {
    service
        .accept(params.id.as_deref().unwrap_or_default(), params.endpoint)
        .await?;
    Ok("ok")
}

async fn health(State(service): State<VerveService>) -> (StatusCode, &'static str) {
    if service.is_admitting() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    }
}
