use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use scribe_core::worker::WorkerSettings;
use scribe_core::{Config, JobRecord, JobRegistry, JobState, MockEngine, SubmitOptions, WorkQueue, Worker};

use crate::{build_state, router, AppState};

const BOUNDARY: &str = "scribe-test-boundary-4aX9";

async fn test_state(dir: &tempfile::TempDir, max_mb: u64) -> AppState {
	let mut config = Config::parse_from([
		"scribe-test",
		"--upload-dir",
		dir.path().to_str().unwrap(),
		"--max-file-size-mb",
		&max_mb.to_string(),
	]);
	// Tests always run against the in-process backing.
	config.queue_backend_url = None;
	build_state(Arc::new(config)).await.unwrap()
}

fn multipart_body(file: Option<(&[u8], &str)>, fields: &[(&str, &str)]) -> Vec<u8> {
	let mut body = Vec::new();
	for (name, value) in fields {
		body.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes());
	}
	if let Some((bytes, content_type)) = file {
		body.extend_from_slice(
			format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"clip.wav\"\r\nContent-Type: {content_type}\r\n\r\n").as_bytes(),
		);
		body.extend_from_slice(bytes);
		body.extend_from_slice(b"\r\n");
	}
	body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
	body
}

fn addr(ip: &str) -> SocketAddr {
	SocketAddr::from((ip.parse::<std::net::IpAddr>().unwrap(), 42424))
}

async fn post_transcribe(app: &Router, body: Vec<u8>, ip: &str) -> (StatusCode, Value) {
	let request = Request::builder()
		.method("POST")
		.uri("/transcribe")
		.header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
		.header("content-length", body.len())
		.extension(ConnectInfo(addr(ip)))
		.body(Body::from(body))
		.unwrap();
	let response = app.clone().oneshot(request).await.unwrap();
	let status = response.status();
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, json)
}

async fn get_json(app: &Router, uri: &str, ip: &str) -> (StatusCode, Value) {
	let request = Request::builder().uri(uri).extension(ConnectInfo(addr(ip))).body(Body::empty()).unwrap();
	let response = app.clone().oneshot(request).await.unwrap();
	let status = response.status();
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, json)
}

async fn delete_json(app: &Router, uri: &str, ip: &str) -> (StatusCode, Value) {
	let request = Request::builder().method("DELETE").uri(uri).extension(ConnectInfo(addr(ip))).body(Body::empty()).unwrap();
	let response = app.clone().oneshot(request).await.unwrap();
	let status = response.status();
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, json)
}

fn spawn_worker(state: &AppState, engine: MockEngine, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
	let worker = Worker::new(
		"test-slot".into(),
		Arc::clone(&state.registry),
		Arc::clone(&state.queue),
		Arc::clone(&state.cache),
		state.blobs.clone(),
		Arc::new(engine),
		WorkerSettings {
			reserve_timeout: Duration::from_millis(50),
			cancel_poll_interval: Duration::from_millis(25),
			..Default::default()
		},
	);
	tokio::spawn(async move { worker.run(shutdown).await })
}

async fn await_state(app: &Router, job_id: &str, ip: &str, wanted: &str) -> Value {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let (status, body) = get_json(app, &format!("/status/{job_id}"), ip).await;
		if status == StatusCode::OK && body["state"] == wanted {
			return body;
		}
		assert!(
			status == StatusCode::OK || status == StatusCode::TOO_MANY_REQUESTS,
			"unexpected status {status}: {body}"
		);
		assert!(tokio::time::Instant::now() < deadline, "job {job_id} never reached {wanted}, last: {body}");
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

// --- submission -----------------------------------------------------------

#[tokio::test]
async fn cold_submit_completes_and_serves_the_transcript() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"riff-wav-bytes", "audio/wav")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.1").await;
	assert_eq!(status, StatusCode::ACCEPTED);
	assert_eq!(json["state"], "Queued");
	let job_id = json["job_id"].as_str().unwrap().to_string();

	let shutdown = CancellationToken::new();
	let handle = spawn_worker(&state, MockEngine::canned(), shutdown.clone());

	let status_body = await_state(&app, &job_id, "10.1.0.1", "Completed").await;
	assert!(status_body["attempt"].as_u64().unwrap() >= 1);
	assert!(status_body["finished_at"].is_u64());

	let (code, transcript) = get_json(&app, &format!("/result/{job_id}"), "10.1.0.1").await;
	assert_eq!(code, StatusCode::OK);
	assert_eq!(transcript["text"], "canned transcript");
	assert_eq!(transcript["language"], "en");
	assert!(transcript["segments"].as_array().unwrap().len() == 1);

	// Side-effect-free: an identical second read.
	let (_, again) = get_json(&app, &format!("/result/{job_id}"), "10.1.0.1").await;
	assert_eq!(transcript, again);

	shutdown.cancel();
	handle.await.unwrap();
}

#[tokio::test]
async fn warm_cache_hit_answers_synchronously_without_enqueueing() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"identical-bytes", "audio/wav")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.2").await;
	assert_eq!(status, StatusCode::ACCEPTED);
	let first_id = json["job_id"].as_str().unwrap().to_string();

	let shutdown = CancellationToken::new();
	let handle = spawn_worker(&state, MockEngine::canned(), shutdown.clone());
	await_state(&app, &first_id, "10.1.0.2", "Completed").await;
	shutdown.cancel();
	handle.await.unwrap();

	// Same bytes, same options: served from the cache, already Completed.
	let body = multipart_body(Some((b"identical-bytes", "audio/wav")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.2").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(json["state"], "Completed");
	let second_id = json["job_id"].as_str().unwrap().to_string();
	assert_ne!(first_id, second_id, "every submission gets its own job id");
	assert_eq!(state.queue.depth().await.unwrap(), 0, "a cache hit must not enqueue");

	let (code, transcript) = get_json(&app, &format!("/result/{second_id}"), "10.1.0.2").await;
	assert_eq!(code, StatusCode::OK);
	assert_eq!(transcript["text"], "canned transcript");
}

#[tokio::test]
async fn fingerprint_options_split_the_cache() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"same-bytes", "audio/wav")), &[]);
	let (status, _) = post_transcribe(&app, body, "10.1.0.3").await;
	assert_eq!(status, StatusCode::ACCEPTED);

	// Different language option: a different fingerprint, so a new queue entry.
	let body = multipart_body(Some((b"same-bytes", "audio/wav")), &[("language", "de")]);
	let (status, _) = post_transcribe(&app, body, "10.1.0.3").await;
	assert_eq!(status, StatusCode::ACCEPTED);
	assert_eq!(state.queue.depth().await.unwrap(), 2);
}

#[tokio::test]
async fn oversize_submission_is_rejected_without_a_record() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 1).await;
	let app = router(state.clone());

	// One byte over the 1 MB cap.
	let payload = vec![0u8; 1024 * 1024 + 1];
	let body = multipart_body(Some((&payload, "audio/wav")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.4").await;
	assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
	assert_eq!(json["error_kind"], "PayloadTooLarge");

	assert_eq!(state.registry.list_by_state(JobState::Queued, 10).await.unwrap().len(), 0);
	assert_eq!(state.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn submission_at_exactly_the_cap_succeeds() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 1).await;
	let app = router(state.clone());

	let payload = vec![0u8; 1024 * 1024];
	let body = multipart_body(Some((&payload, "audio/wav")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.5").await;
	assert_eq!(status, StatusCode::ACCEPTED, "{json}");
}

#[tokio::test]
async fn undeclared_media_types_are_refused() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"PK\x03\x04", "application/zip")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.6").await;
	assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
	assert_eq!(json["error_kind"], "UnsupportedMedia");
}

#[tokio::test]
async fn unknown_options_are_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"bytes", "audio/wav")), &[("beam_size", "5")]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.7").await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(json["error_kind"], "UnknownOption");
	// The provisional blob must not survive the rejection.
	assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn missing_file_field_is_a_bad_request() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(None, &[("language", "en")]);
	let (status, json) = post_transcribe(&app, body, "10.1.0.8").await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(json["error_kind"], "BadRequest");
}

#[tokio::test]
async fn submission_bucket_exhausts_with_retry_after() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	for i in 0..10 {
		// Distinct bytes so the cache path is never taken.
		let body = multipart_body(Some((format!("clip-{i}").as_bytes(), "audio/wav")), &[]);
		let (status, _) = post_transcribe(&app, body, "10.9.9.9").await;
		assert_eq!(status, StatusCode::ACCEPTED, "submission {i} should pass");
	}

	let body = multipart_body(Some((b"the-eleventh", "audio/wav")), &[]);
	let (status, json) = post_transcribe(&app, body, "10.9.9.9").await;
	assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(json["error_kind"], "RateLimited");
	assert!(json["retry_after"].as_u64().unwrap() >= 1);

	// A different caller is unaffected.
	let body = multipart_body(Some((b"other-caller", "audio/wav")), &[]);
	let (status, _) = post_transcribe(&app, body, "10.9.9.10").await;
	assert_eq!(status, StatusCode::ACCEPTED);
}

// --- polling --------------------------------------------------------------

#[tokio::test]
async fn status_of_unknown_job_is_not_found() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let (status, json) = get_json(&app, "/status/no-such-job", "10.2.0.1").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	assert_eq!(json["error_kind"], "NotFound");
}

#[tokio::test]
async fn result_before_completion_echoes_the_state() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"pending-bytes", "audio/wav")), &[]);
	let (_, json) = post_transcribe(&app, body, "10.2.0.2").await;
	let job_id = json["job_id"].as_str().unwrap();

	let (status, json) = get_json(&app, &format!("/result/{job_id}"), "10.2.0.2").await;
	assert_eq!(status, StatusCode::CONFLICT);
	assert_eq!(json["state"], "Queued");
}

#[tokio::test]
async fn expired_cache_entry_turns_the_result_gone() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	// A Completed record whose cache entry has since expired.
	let record = JobRecord::completed_from_cache("stale-job".into(), "stale-fp".into(), "a.wav".into(), SubmitOptions::default());
	state.registry.create(&record).await.unwrap();

	let (status, json) = get_json(&app, "/result/stale-job", "10.2.0.3").await;
	assert_eq!(status, StatusCode::GONE);
	assert_eq!(json["error_kind"], "Gone");
}

#[tokio::test]
async fn failed_jobs_surface_their_stored_error() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"doomed-bytes", "audio/wav")), &[]);
	let (_, json) = post_transcribe(&app, body, "10.2.0.4").await;
	let job_id = json["job_id"].as_str().unwrap().to_string();

	let shutdown = CancellationToken::new();
	// Fails more times than the attempt cap allows.
	let handle = spawn_worker(&state, MockEngine::canned().failing_times(10), shutdown.clone());
	let status_body = await_state(&app, &job_id, "10.2.0.4", "Failed").await;
	shutdown.cancel();
	handle.await.unwrap();

	assert_eq!(status_body["error_kind"], "DecodeError");
	assert!(status_body["error_message"].is_string());
	assert_eq!(status_body["attempt"].as_u64().unwrap(), 3);

	let (code, echoed) = get_json(&app, &format!("/result/{job_id}"), "10.2.0.4").await;
	assert_eq!(code, StatusCode::CONFLICT);
	assert_eq!(echoed["state"], "Failed");
	assert_eq!(echoed["error_kind"], "DecodeError");
}

// --- cancellation ---------------------------------------------------------

#[tokio::test]
async fn cancel_while_queued_tombstones_and_workers_skip() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	// No workers running yet.
	let body = multipart_body(Some((b"cancel-me", "audio/wav")), &[]);
	let (_, json) = post_transcribe(&app, body, "10.3.0.1").await;
	let job_id = json["job_id"].as_str().unwrap().to_string();

	let (status, json) = delete_json(&app, &format!("/job/{job_id}"), "10.3.0.1").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(json["state"], "Cancelled");

	// A worker that starts later reserves the id, loses the CAS, and acks.
	let shutdown = CancellationToken::new();
	let handle = spawn_worker(&state, MockEngine::canned(), shutdown.clone());
	tokio::time::sleep(Duration::from_millis(300)).await;
	shutdown.cancel();
	handle.await.unwrap();

	let status_body = await_state(&app, &job_id, "10.3.0.1", "Cancelled").await;
	assert_eq!(status_body["attempt"].as_u64().unwrap(), 0, "a cancelled-before-reserve job never executes");
	assert_eq!(state.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_is_idempotent_and_terminal_states_refuse() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"twice-cancelled", "audio/wav")), &[]);
	let (_, json) = post_transcribe(&app, body, "10.3.0.2").await;
	let job_id = json["job_id"].as_str().unwrap().to_string();

	let (first, _) = delete_json(&app, &format!("/job/{job_id}"), "10.3.0.2").await;
	let (second, body2) = delete_json(&app, &format!("/job/{job_id}"), "10.3.0.2").await;
	assert_eq!(first, StatusCode::OK);
	assert_eq!(second, StatusCode::OK, "cancel of a Cancelled job is an ok no-op");
	assert_eq!(body2["state"], "Cancelled");

	// A Completed job refuses.
	let record = JobRecord::completed_from_cache("done-job".into(), "fp".into(), "a.wav".into(), SubmitOptions::default());
	state.registry.create(&record).await.unwrap();
	let (status, json) = delete_json(&app, "/job/done-job", "10.3.0.2").await;
	assert_eq!(status, StatusCode::CONFLICT);
	assert_eq!(json["error_kind"], "NotCancellable");
}

// --- operational surface --------------------------------------------------

#[tokio::test]
async fn root_lists_the_endpoints() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state);

	let (status, json) = get_json(&app, "/", "10.4.0.1").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(json["service"], "scribe");
	assert!(json["endpoints"]["transcribe"].is_string());
}

#[tokio::test]
async fn health_degrades_without_worker_heartbeats() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let (status, json) = get_json(&app, "/health", "10.4.0.2").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(json["status"], "degraded");
	assert_eq!(json["queue_backend_reachable"], true);
	assert_eq!(json["worker_heartbeat_fresh"], false);

	state.registry.record_heartbeat("w0", Duration::from_secs(60)).await.unwrap();
	let (_, json) = get_json(&app, "/health", "10.4.0.2").await;
	assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn stats_reports_queue_pressure() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state.clone());

	let body = multipart_body(Some((b"stats-bytes", "audio/wav")), &[]);
	post_transcribe(&app, body, "10.4.0.3").await;

	let (status, json) = get_json(&app, "/stats", "10.4.0.3").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(json["queue_depth"], 1);
	assert_eq!(json["in_progress"], 0);
	assert_eq!(json["workers"], 0);
}

#[tokio::test]
async fn metrics_exposition_is_served() {
	let dir = tempfile::tempdir().unwrap();
	let state = test_state(&dir, 10).await;
	let app = router(state);

	let request = Request::builder().uri("/metrics").extension(ConnectInfo(addr("10.4.0.4"))).body(Body::empty()).unwrap();
	let response = app.oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	let text = String::from_utf8(bytes.to_vec()).unwrap();
	assert!(text.contains("queue_depth"));
	assert!(text.contains("transcription_in_progress"));
}
