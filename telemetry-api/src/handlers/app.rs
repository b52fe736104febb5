use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use telemetry_common::health::HealthRegistry;
use telemetry_common::metrics::track_metrics;
use telemetry_common::store::EventStore;

use super::{events, stats};
use crate::time::TimeSource;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
}

pub fn app(
    state: AppState,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
    max_body_size: usize,
) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/events/batch", routing::post(events::post_batch))
        .route("/stats", routing::get(stats::get_stats))
        .route(
            "/stats/top-defect-lines",
            routing::get(stats::get_top_defect_lines),
        )
        .route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        )
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Only one recorder can be installed per process, so the caller decides whether we export.
    match metrics {
        Some(recorder_handle) => router.route(
            "/metrics",
            routing::get(move || ready(recorder_handle.render())),
        ),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "machine telemetry"
}
