use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::{header::CONTENT_LENGTH, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use scribe_core::job::sanitize_filename;
use scribe_core::metrics::{self, outcome};
use scribe_core::rate_limit::BucketClass;
use scribe_core::{Fingerprinter, JobRecord, JobRegistry, JobState, ResultCache, ScribeError, SubmitOptions, WorkQueue};

use super::caller_identity;
use crate::error::ApiError;
use crate::AppState;

/// Multipart framing overhead tolerated on top of the payload cap when
/// pre-checking Content-Length; the blob writer enforces the exact cap.
const MULTIPART_ALLOWANCE: u64 = 64 * 1024;

/// Ceiling on reading the request body before the partial upload is dropped.
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(300);

const ALLOWED_MEDIA_TYPES: &[&str] = &[
	"audio/mpeg",
	"audio/mp3",
	"audio/wav",
	"audio/x-wav",
	"audio/wave",
	"audio/mp4",
	"audio/m4a",
	"audio/x-m4a",
	"audio/flac",
	"audio/x-flac",
	"audio/ogg",
	"audio/webm",
];

#[derive(Serialize)]
pub struct SubmitResponse {
	pub job_id: String,
	pub state: JobState,
}

/// POST /transcribe: validate, stream to the blob store while fingerprinting,
/// then either answer synchronously from the result cache or enroll a Queued
/// job and push it onto the work queue.
pub async fn transcribe(
	State(state): State<AppState>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	multipart: Multipart,
) -> Result<Response, ApiError> {
	match submit_inner(&state, &headers, addr, multipart).await {
		Ok(response) => Ok(response),
		Err(e) => {
			metrics::TRANSCRIPTION_REQUESTS_TOTAL.with_label_values(&[outcome::REJECTED]).inc();
			Err(e)
		}
	}
}

async fn submit_inner(state: &AppState, headers: &HeaderMap, addr: SocketAddr, multipart: Multipart) -> Result<Response, ApiError> {
	let caller = caller_identity(headers, addr);
	state.limiter.try_acquire(BucketClass::Submit, &caller)?;

	// Reject declared-oversize bodies before reading them.
	let cap = state.config.max_file_size_bytes();
	if let Some(declared) = headers.get(CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok()) {
		if declared > cap + MULTIPART_ALLOWANCE {
			return Err(ScribeError::PayloadTooLarge {
				limit_mb: state.config.max_file_size_mb,
			}
			.into());
		}
	}

	let job_id = Uuid::new_v4().to_string();
	let upload = match tokio::time::timeout(BODY_READ_TIMEOUT, read_upload(state, &job_id, multipart)).await {
		Ok(result) => result,
		Err(_) => {
			state.blobs.delete(&job_id).await?;
			return Err(ScribeError::BadRequest("request body was not received in time".into()).into());
		}
	};
	let upload = match upload {
		Ok(upload) => upload,
		Err(e) => {
			// Never leave a provisional blob behind on a rejected submission.
			state.blobs.delete(&job_id).await?;
			return Err(e);
		}
	};

	let fingerprint = upload.fingerprinter.finalize(&upload.options);

	if let Some(_cached) = state.cache.lookup(&fingerprint).await? {
		state.blobs.delete(&job_id).await?;
		let record = JobRecord::completed_from_cache(job_id.clone(), fingerprint, upload.filename, upload.options);
		state.registry.create(&record).await?;
		metrics::CACHE_HITS_TOTAL.inc();
		metrics::TRANSCRIPTION_REQUESTS_TOTAL.with_label_values(&[outcome::CACHED]).inc();
		info!(%job_id, "submission answered from the result cache");

		return Ok((
			StatusCode::OK,
			Json(SubmitResponse {
				job_id: record.job_id,
				state: record.state,
			}),
		)
			.into_response());
	}
	metrics::CACHE_MISSES_TOTAL.inc();

	let record = JobRecord::new(job_id.clone(), fingerprint, upload.filename, upload.options);
	state.registry.create(&record).await?;
	state.queue.push(&job_id).await?;
	metrics::TRANSCRIPTION_REQUESTS_TOTAL.with_label_values(&[outcome::SUBMITTED]).inc();
	info!(%job_id, size = upload.size, "job enqueued");

	Ok((
		StatusCode::ACCEPTED,
		Json(SubmitResponse {
			job_id: record.job_id,
			state: record.state,
		}),
	)
		.into_response())
}

struct Upload {
	filename: String,
	size: u64,
	options: SubmitOptions,
	fingerprinter: Fingerprinter,
}

/// Walk the multipart fields in request order: the audio part streams into
/// the blob store while the fingerprint digests it, option parts accumulate,
/// anything else is rejected.
async fn read_upload(state: &AppState, job_id: &str, mut multipart: Multipart) -> Result<Upload, ApiError> {
	let mut options = SubmitOptions::default();
	let mut fingerprinter = Fingerprinter::new();
	let mut stored: Option<(String, u64)> = None;

	while let Some(mut field) = multipart.next_field().await? {
		let name = field.name().unwrap_or_default().to_string();
		match name.as_str() {
			"file" => {
				if stored.is_some() {
					return Err(ScribeError::BadRequest("duplicate file field".into()).into());
				}
				let declared = field.content_type().unwrap_or_default().to_ascii_lowercase();
				if !ALLOWED_MEDIA_TYPES.contains(&declared.as_str()) {
					return Err(ScribeError::UnsupportedMedia(declared).into());
				}
				let filename = sanitize_filename(field.file_name().unwrap_or("upload"));

				let mut writer = state.blobs.writer(job_id).await?;
				loop {
					let chunk = match field.chunk().await {
						Ok(Some(chunk)) => chunk,
						Ok(None) => break,
						Err(e) => {
							writer.abort().await?;
							return Err(e.into());
						}
					};
					if let Err(e) = writer.write(&chunk).await {
						writer.abort().await?;
						return Err(e.into());
					}
					fingerprinter.update(&chunk);
				}
				let size = writer.finish().await?;
				stored = Some((filename, size));
			}
			"language" => {
				let value = field.text().await?.trim().to_string();
				if !value.is_empty() && !(value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic())) {
					return Err(ScribeError::BadRequest("language must be an ISO 639-1 code".into()).into());
				}
				options.language = value;
			}
			"vad_filter" => {
				options.vad_filter = match field.text().await?.trim() {
					"true" | "1" => true,
					"false" | "0" | "" => false,
					other => {
						warn!(value = other, "unparseable vad_filter");
						return Err(ScribeError::BadRequest("vad_filter must be a boolean".into()).into());
					}
				};
			}
			"initial_prompt" => {
				let value = field.text().await?;
				if value.len() > SubmitOptions::MAX_PROMPT_BYTES {
					return Err(ScribeError::BadRequest("initial_prompt exceeds 1 KiB".into()).into());
				}
				options.initial_prompt = value;
			}
			other => {
				return Err(ScribeError::UnknownOption(other.to_string()).into());
			}
		}
	}

	let (filename, size) = stored.ok_or_else(|| ScribeError::BadRequest("missing file field".into()))?;
	if size == 0 {
		return Err(ScribeError::BadRequest("uploaded file is empty".into()).into());
	}

	Ok(Upload {
		filename,
		size,
		options,
		fingerprinter,
	})
}
