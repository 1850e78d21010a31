use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use dispatch_core::observability::get_metrics;
use serde_json::json;

use super::AppState;

/// Liveness for Docker/K8s probes.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": state.service_name,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Ready once every required connection reports its tunnel serving.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut unavailable = Vec::new();

    for name in &state.registry.settings().required_connections {
        let serving = match state.registry.get(name) {
            Ok(client) => client.health().is_serving().await,
            Err(_) => false,
        };
        if !serving {
            unavailable.push(name.clone());
        }
    }

    if unavailable.is_empty() {
        tracing::debug!("Readiness check passed");
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        tracing::warn!(unavailable = ?unavailable, "Readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "unavailable": unavailable })),
        )
    }
}

/// Metrics endpoint for Prometheus scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
