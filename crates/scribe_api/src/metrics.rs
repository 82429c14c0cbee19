use axum::{
	body::Body,
	http::{Request, Response, StatusCode},
	middleware::Next,
};
use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};
use std::time::Instant;

lazy_static! {
	static ref HTTP_REQUESTS_TOTAL: IntCounterVec =
		register_int_counter_vec!("http_requests_total", "Total number of HTTP requests", &["method", "route", "status"]).expect("Failed to register HTTP_REQUESTS_TOTAL");
	static ref HTTP_REQUEST_DURATION: HistogramVec =
		register_histogram_vec!("http_request_duration_seconds", "HTTP request duration in seconds", &["method", "route"]).expect("Failed to register HTTP_REQUEST_DURATION");
}

/// Middleware for Prometheus metrics collection
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response<Body> {
	let method = req.method().to_string();
	let route = normalize_path(req.uri().path());

	let start = Instant::now();
	let response = next.run(req).await;
	let duration = start.elapsed().as_secs_f64();

	let status = response.status().as_u16().to_string();

	HTTP_REQUESTS_TOTAL.with_label_values(&[&method, &route, &status]).inc();
	HTTP_REQUEST_DURATION.with_label_values(&[&method, &route]).observe(duration);

	response
}

/// Collapse job-id path segments so label cardinality stays bounded.
fn normalize_path(path: &str) -> String {
	let trimmed = path.trim_end_matches('/').split('?').next().unwrap_or("/");
	let mut segments = trimmed.split('/').filter(|s| !s.is_empty());
	match segments.next() {
		Some(head @ ("status" | "result" | "job")) => format!("/{head}/:job_id"),
		Some(head) => format!("/{head}"),
		None => "/".to_string(),
	}
}

/// Prometheus metrics handler
pub async fn metrics_handler() -> Result<String, StatusCode> {
	scribe_core::metrics::render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
