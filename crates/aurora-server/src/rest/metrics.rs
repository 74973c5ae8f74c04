//! Metrics endpoints

use super::AppState;
use aurora_metrics::MetricsSnapshot;
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn create_metrics_router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/prometheus/metrics", get(get_prometheus_metrics))
}

/// GET /metrics - JSON registry dump
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.server_metrics.snapshot())
}

/// GET /prometheus/metrics
async fn get_prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.server_metrics.render_prometheus(),
    )
}
