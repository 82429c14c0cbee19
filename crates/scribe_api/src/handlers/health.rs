use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use scribe_core::{JobRegistry, JobState, WorkQueue};

use crate::error::ApiError;
use crate::AppState;

/// GET /: service description, mirrors what a client needs to get started.
pub async fn root() -> Json<serde_json::Value> {
	Json(json!({
		"service": "scribe",
		"version": env!("CARGO_PKG_VERSION"),
		"endpoints": {
			"transcribe": "POST /transcribe",
			"status": "GET /status/{job_id}",
			"result": "GET /result/{job_id}",
			"cancel": "DELETE /job/{job_id}",
			"health": "GET /health",
			"stats": "GET /stats",
			"metrics": "GET /metrics",
		},
	}))
}

#[derive(Serialize)]
pub struct HealthResponse {
	pub status: &'static str,
	pub queue_backend_reachable: bool,
	pub worker_heartbeat_fresh: bool,
}

/// GET /health: aggregate of the queue backing and worker liveness.
/// An unreachable backing is `down` and answers 503; a reachable backing
/// with no fresh worker heartbeat degrades but still serves.
pub async fn health(State(state): State<AppState>) -> Response {
	let queue_backend_reachable = state.queue.ping().await && state.registry.ping().await;
	let worker_heartbeat_fresh = state.registry.alive_workers().await.map(|n| n > 0).unwrap_or(false);

	let (status, code) = match (queue_backend_reachable, worker_heartbeat_fresh) {
		(true, true) => ("ok", StatusCode::OK),
		(true, false) => ("degraded", StatusCode::OK),
		(false, _) => ("down", StatusCode::SERVICE_UNAVAILABLE),
	};

	(
		code,
		Json(HealthResponse {
			status,
			queue_backend_reachable,
			worker_heartbeat_fresh,
		}),
	)
		.into_response()
}

#[derive(Serialize)]
pub struct StatsResponse {
	pub queue_depth: usize,
	pub in_progress: usize,
	pub workers: usize,
}

/// GET /stats: operator snapshot of pipeline pressure.
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
	let queue_depth = state.queue.depth().await?;
	let in_progress = state.registry.list_by_state(JobState::Processing, 10_000).await?.len();
	let workers = state.registry.alive_workers().await?;

	Ok(Json(StatsResponse {
		queue_depth,
		in_progress,
		workers,
	}))
}
