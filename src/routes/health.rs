use crate::health::HealthStatus;
use crate::server::Server;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

pub fn create_health_routes() -> Router<Server> {
    Router::new().route("/", get(health_check))
}

/// Handle GET /health.
///
/// Degraded components still answer 200 so orchestrators keep routing
/// traffic; only an unhealthy component turns the endpoint 503.
pub async fn health_check(State(server): State<Server>) -> Response {
    let health = server.health_service.check_health().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(health)).into_response()
}
