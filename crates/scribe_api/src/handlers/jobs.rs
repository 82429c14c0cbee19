use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::info;

use scribe_core::job::now_epoch_secs;
use scribe_core::rate_limit::BucketClass;
use scribe_core::{JobRecord, JobRegistry, JobState, ResultCache, ScribeError};

use super::caller_identity;
use crate::error::ApiError;
use crate::AppState;

/// Server-side deadline on polling reads.
const POLL_DEADLINE: Duration = Duration::from_secs(2);

async fn with_deadline<T>(fut: impl Future<Output = Result<T, ScribeError>>) -> Result<T, ScribeError> {
	match tokio::time::timeout(POLL_DEADLINE, fut).await {
		Ok(result) => result,
		Err(_) => Err(ScribeError::RegistryUnavailable("poll deadline exceeded".into())),
	}
}

#[derive(Serialize)]
pub struct StatusResponse {
	pub job_id: String,
	pub state: JobState,
	pub filename: String,
	pub submitted_at: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started_at: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finished_at: Option<u64>,
	pub attempt: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_kind: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl From<JobRecord> for StatusResponse {
	fn from(record: JobRecord) -> Self {
		Self {
			job_id: record.job_id,
			state: record.state,
			filename: record.filename,
			submitted_at: record.submitted_at,
			started_at: record.started_at,
			finished_at: record.finished_at,
			attempt: record.attempt,
			error_kind: record.error_kind,
			error_message: record.error_message,
		}
	}
}

/// GET /status/{job_id}
pub async fn status(
	State(state): State<AppState>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
	let caller = caller_identity(&headers, addr);
	state.limiter.try_acquire(BucketClass::Poll, &caller)?;

	let record = with_deadline(state.registry.get(&job_id)).await?;
	Ok(Json(record.into()))
}

/// GET /result/{job_id}: the transcript body once Completed; otherwise the
/// current state (with any stored failure verbatim) under 409, or 410 when
/// the cached transcript has expired.
pub async fn result(
	State(state): State<AppState>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
	let caller = caller_identity(&headers, addr);
	state.limiter.try_acquire(BucketClass::Poll, &caller)?;

	let record = with_deadline(state.registry.get(&job_id)).await?;
	if record.state != JobState::Completed {
		let body: StatusResponse = record.into();
		return Ok((StatusCode::CONFLICT, Json(body)).into_response());
	}

	let handle = record.result_handle.as_deref().ok_or(ScribeError::Gone)?;
	match with_deadline(state.cache.lookup(handle)).await? {
		Some(transcript) => Ok(Json(transcript).into_response()),
		None => Err(ScribeError::Gone.into()),
	}
}

#[derive(Serialize)]
pub struct CancelResponse {
	pub job_id: String,
	pub state: JobState,
}

/// DELETE /job/{job_id}: tombstone a Queued job, flag a Processing one for
/// cooperative abandonment. Cancelling an already-Cancelled job is an ok
/// no-op; other terminal states refuse.
pub async fn cancel(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<CancelResponse>, ApiError> {
	// The CAS can lose to a worker transition; re-read and retry a couple of
	// times before giving up.
	for _ in 0..3 {
		let record = state.registry.get(&job_id).await?;
		match record.state {
			JobState::Cancelled => {
				return Ok(Json(CancelResponse {
					job_id,
					state: JobState::Cancelled,
				}));
			}
			JobState::Completed | JobState::Failed => {
				return Err(ScribeError::NotCancellable { state: record.state }.into());
			}
			JobState::Queued => {
				let mut tombstoned = record.clone();
				tombstoned.state = JobState::Cancelled;
				tombstoned.finished_at = Some(now_epoch_secs());
				match state.registry.compare_and_swap(&job_id, JobState::Queued, tombstoned).await {
					Ok(_) => {
						info!(%job_id, "queued job tombstoned");
						return Ok(Json(CancelResponse {
							job_id,
							state: JobState::Cancelled,
						}));
					}
					Err(ScribeError::StateMismatch { .. }) => continue,
					Err(e) => return Err(e.into()),
				}
			}
			JobState::Processing => {
				let mut flagged = record.clone();
				flagged.cancel_requested = true;
				match state.registry.compare_and_swap(&job_id, JobState::Processing, flagged).await {
					Ok(_) => {
						info!(%job_id, "cancellation requested for in-flight job");
						// The worker confirms the transition at its next
						// cooperative checkpoint; report the intent now.
						return Ok(Json(CancelResponse {
							job_id,
							state: JobState::Cancelled,
						}));
					}
					Err(ScribeError::StateMismatch { .. }) => continue,
					Err(e) => return Err(e.into()),
				}
			}
		}
	}

	let record = state.registry.get(&job_id).await?;
	Err(ScribeError::NotCancellable { state: record.state }.into())
}
