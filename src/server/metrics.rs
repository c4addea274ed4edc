use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all MediaDrop metrics
const PREFIX: &str = "mediadrop";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Ingestion Metrics
    pub static ref UPLOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_uploads_total"), "Uploads by outcome"),
        &["outcome"]
    ).expect("Failed to create uploads_total metric");

    pub static ref UPLOAD_BYTES_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_upload_bytes_total"),
        "Total bytes received in upload bodies"
    ).expect("Failed to create upload_bytes_total metric");

    pub static ref CONVERSIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_conversions_total"), "Conversion jobs by outcome"),
        &["outcome"]
    ).expect("Failed to create conversions_total metric");

    pub static ref CONVERSION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_conversion_duration_seconds"),
            "Conversion job duration in seconds"
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0, 1800.0]),
        &["outcome"]
    ).expect("Failed to create conversion_duration_seconds metric");

    pub static ref TRACKED_SESSIONS: Gauge = Gauge::new(
        format!("{PREFIX}_tracked_sessions"),
        "Number of upload sessions held by the progress tracker"
    ).expect("Failed to create tracked_sessions metric");

    pub static ref STORED_ASSETS: Gauge = Gauge::new(
        format!("{PREFIX}_stored_assets"),
        "Number of unique assets in the storage root"
    ).expect("Failed to create stored_assets metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(UPLOADS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(UPLOAD_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CONVERSIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CONVERSION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TRACKED_SESSIONS.clone()));
    let _ = REGISTRY.register(Box::new(STORED_ASSETS.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Collapse per-resource paths so labels stay low-cardinality.
pub fn route_label(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/upload" => "/upload",
        "/uploads" => "/uploads",
        "/setup" => "/setup",
        p if p.starts_with("/upload/") => "/upload/{session_id}",
        p if p.starts_with("/asset/") => "/asset/{fingerprint}",
        _ => "other",
    }
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let route = route_label(path);
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, route, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, route])
        .observe(duration.as_secs_f64());
}

/// Record a finished upload: "stored", "duplicate" or "failed"
pub fn record_upload(outcome: &str) {
    UPLOADS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_received_bytes(bytes: u64) {
    UPLOAD_BYTES_TOTAL.inc_by(bytes);
}

/// Record a finished conversion job
pub fn record_conversion(outcome: &str, duration: Duration) {
    CONVERSIONS_TOTAL.with_label_values(&[outcome]).inc();
    CONVERSION_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn set_tracked_sessions(count: usize) {
    TRACKED_SESSIONS.set(count as f64);
}

pub fn set_stored_assets(count: usize) {
    STORED_ASSETS.set(count as f64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
