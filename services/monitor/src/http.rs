//! HTTP surface of the monitor service.
//!
//! - `/snapshot`: latest published [`MetricsSnapshot`](fleetwatch_monitor::MetricsSnapshot) as JSON.
//! - `/metrics`: Prometheus exposition.
//! - `/live`: process liveness, always "ok".
//! - `/ready`: "ok" while the subscriber holds a broker subscription, 503 otherwise.
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use fleetwatch_monitor::{MetricsQuery, SubscriberStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

#[derive(Clone)]
struct AppState {
    metrics: PrometheusHandle,
    query: MetricsQuery,
    status: Arc<SubscriberStatus>,
}

pub fn router(
    metrics: PrometheusHandle,
    query: MetricsQuery,
    status: Arc<SubscriberStatus>,
) -> Router {
    Router::new()
        .route("/snapshot", get(snapshot))
        .route("/metrics", get(render_metrics))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .with_state(AppState {
            metrics,
            query,
            status,
        })
}

async fn snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.query.to_json())
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.status.is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "subscriber not connected")
    }
}
