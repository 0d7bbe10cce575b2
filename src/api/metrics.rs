//! Prometheus metrics endpoint
//!
//! Exposes application metrics in Prometheus format.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{DELIVERY_JOBS, FOLLOWERS_TOTAL, REGISTRY};

/// Refresh gauges that are derived from stored state
async fn refresh_gauges(state: &AppState) {
    match state.db.count_jobs_by_state().await {
        Ok(counts) => {
            for (job_state, count) in counts {
                DELIVERY_JOBS
                    .with_label_values(&[job_state.as_str()])
                    .set(count);
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to count delivery jobs"),
    }

    match state.db.count_followers(&state.config.actor_url()).await {
        Ok(count) => FOLLOWERS_TOTAL.set(count),
        Err(e) => tracing::warn!(error = %e, "Failed to count followers"),
    }
}

/// Metrics endpoint handler
///
/// Returns all metrics in Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    refresh_gauges(&state).await;

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes the `/metrics` endpoint.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
