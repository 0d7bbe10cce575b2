//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinote_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedinote_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinote_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type", "result"]
    ).expect("metric can be created");
    pub static ref ACTOR_RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinote_actor_resolutions_total", "Total number of remote actor resolutions"),
        &["source"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedinote_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinote_delivery_attempts_total", "Total number of delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_JOBS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedinote_delivery_jobs", "Current number of delivery jobs by state"),
        &["state"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_IN_FLIGHT: IntGauge = IntGauge::new(
        "fedinote_deliveries_in_flight",
        "Deliveries currently being attempted"
    ).expect("metric can be created");

    // Application Metrics
    pub static ref NOTES_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinote_notes_published_total", "Total number of notes published"),
        &["result"]
    ).expect("metric can be created");
    pub static ref FOLLOWERS_TOTAL: IntGauge = IntGauge::new(
        "fedinote_followers_total",
        "Total number of followers"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinote_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("HTTP_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
            .expect("HTTP_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()))
            .expect("ACTIVITYPUB_ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(ACTOR_RESOLUTIONS_TOTAL.clone()))
            .expect("ACTOR_RESOLUTIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
            .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
            .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_JOBS.clone()))
            .expect("DELIVERY_JOBS can be registered");
        REGISTRY
            .register(Box::new(DELIVERIES_IN_FLIGHT.clone()))
            .expect("DELIVERIES_IN_FLIGHT can be registered");
        REGISTRY
            .register(Box::new(NOTES_PUBLISHED_TOTAL.clone()))
            .expect("NOTES_PUBLISHED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FOLLOWERS_TOTAL.clone()))
            .expect("FOLLOWERS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
