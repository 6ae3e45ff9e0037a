//! Prometheus metrics for casgate.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "casgate_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "casgate_http_request_duration_seconds";

/// Direct uploads committed to the store (counter). Labels: exists.
pub const UPLOADS_TOTAL: &str = "casgate_uploads_total";

/// Presigned upload authorizations issued (counter).
pub const AUTHORIZATIONS_ISSUED_TOTAL: &str = "casgate_authorizations_issued_total";

/// Writes whose stored digest did not match the claimed hash (counter).
pub const INTEGRITY_FAILURES_TOTAL: &str = "casgate_integrity_failures_total";

/// Hashes processed by bulk query/sync (counter). Labels: op.
pub const RECONCILE_HASHES_TOTAL: &str = "casgate_reconcile_hashes_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOADS_TOTAL, "Direct uploads committed, by exists policy");
    describe_counter!(
        AUTHORIZATIONS_ISSUED_TOTAL,
        "Presigned upload authorizations issued"
    );
    describe_counter!(
        INTEGRITY_FAILURES_TOTAL,
        "Uploads whose stored digest differs from the claimed hash"
    );
    describe_counter!(
        RECONCILE_HASHES_TOTAL,
        "Hashes processed by bulk query and sync"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    // Do not instrument the metrics endpoint itself.
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Hashes in the path would give every object its own label value.
///
/// Examples:
/// - `/objects` -> `/objects`
/// - `/objects/query` -> `/objects/query`
/// - `/objects/d41d8cd9...` -> `/objects/{hash}`
/// - anything unrouted -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/openapi.json" | "/metrics" | "/objects" | "/objects/query"
        | "/sync" | "/sync-query" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            match trimmed.split_once('/') {
                Some(("objects", rest)) if !rest.is_empty() && !rest.contains('/') => {
                    "/objects/{hash}".to_string()
                }
                _ => "/{other}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        for path in [
            "/health",
            "/openapi.json",
            "/metrics",
            "/objects",
            "/objects/query",
            "/sync",
            "/sync-query",
        ] {
            assert_eq!(normalize_path(path), path);
        }
    }

    #[test]
    fn test_normalize_path_hash() {
        assert_eq!(
            normalize_path("/objects/d41d8cd98f00b204e9800998ecf8427e"),
            "/objects/{hash}"
        );
        assert_eq!(normalize_path("/objects/ABC"), "/objects/{hash}");
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/"), "/{other}");
        assert_eq!(normalize_path("/objects/a/b"), "/{other}");
        assert_eq!(normalize_path("/random"), "/{other}");
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_after_init() {
        init_metrics();
        describe_metrics();
        let resp = metrics_handler().await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
