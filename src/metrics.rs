use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;
use tracing::info;

/// Initialize the Prometheus metrics exporter on a dedicated port.
pub fn init_metrics_with_port(
    port: u16,
) -> Result<PrometheusHandle, Box<dyn std::error::Error + Send + Sync>> {
    let builder = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .add_global_label("service", "grok_proxy");

    let handle = builder.install_recorder()?;

    info!("Metrics exporter listening on :{}/metrics", port);
    Ok(handle)
}

/// Middleware to collect HTTP request metrics
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    gauge!("grokproxy_http_requests_active").increment(1.0);

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status().as_u16().to_string();

    counter!(
        "grokproxy_requests_total",
        "method" => method.to_string(),
        "path" => path.clone(),
        "status" => status.clone()
    )
    .increment(1);
    histogram!(
        "grokproxy_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path,
        "status" => status
    )
    .record(duration.as_secs_f64());

    gauge!("grokproxy_http_requests_active").decrement(1.0);

    response
}

/// Track one terminal generation outcome.
pub fn record_generation(model: &str, provider: &str, status: u16, latency_ms: i64) {
    counter!(
        "grokproxy_generations_total",
        "model" => model.to_string(),
        "provider" => provider.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        "grokproxy_generation_latency_seconds",
        "model" => model.to_string(),
        "provider" => provider.to_string()
    )
    .record(latency_ms as f64 / 1000.0);
}

/// Track a coordinator-level error by taxonomy type.
pub fn record_error(error_type: &'static str, endpoint: &'static str) {
    counter!(
        "grokproxy_errors_total",
        "type" => error_type,
        "endpoint" => endpoint
    )
    .increment(1);
}

/// Track a session leaving rotation.
pub fn record_session_rotation(reason: &str) {
    counter!("grokproxy_session_rotations_total", "reason" => reason.to_string()).increment(1);
}

/// Refresh the per-status session gauges from a pool scan.
pub fn update_session_gauges(stats: &crate::pool::PoolStats) {
    gauge!("grokproxy_active_sessions", "status" => "healthy").set(stats.healthy as f64);
    gauge!("grokproxy_active_sessions", "status" => "quarantined").set(stats.quarantined as f64);
    gauge!("grokproxy_active_sessions", "status" => "expired").set(stats.expired as f64);
    gauge!("grokproxy_active_sessions", "status" => "revoked").set(stats.revoked as f64);
    gauge!("grokproxy_sessions_in_flight").set(stats.in_flight as f64);
}

/// Track circuit breaker state as a numeric gauge (0 closed, 1 open, 2 half-open).
pub fn record_circuit_state(state: crate::chat_service::circuit::CircuitState) {
    use crate::chat_service::circuit::CircuitState;
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!("grokproxy_circuit_state").set(value);
}
