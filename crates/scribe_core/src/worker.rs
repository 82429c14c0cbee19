use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::cache::ResultCache;
use crate::engine::{EngineError, TranscriptionEngine};
use crate::error::ScribeError;
use crate::job::{now_epoch_secs, JobRecord, JobState};
use crate::metrics;
use crate::queue::WorkQueue;
use crate::registry::JobRegistry;

/// Tunables for one worker slot.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
	pub reserve_timeout: Duration,
	/// How often the registry is re-read while the engine runs, to observe
	/// cancellation tombstones.
	pub cancel_poll_interval: Duration,
	pub transcribe_timeout: Duration,
	pub max_attempts: u32,
	pub jobs_before_restart: u32,
	pub cache_ttl: Duration,
	pub heartbeat_ttl: Duration,
}

impl Default for WorkerSettings {
	fn default() -> Self {
		Self {
			reserve_timeout: Duration::from_secs(5),
			cancel_poll_interval: Duration::from_secs(2),
			transcribe_timeout: Duration::from_secs(600),
			max_attempts: 3,
			jobs_before_restart: 50,
			cache_ttl: Duration::from_secs(3600),
			heartbeat_ttl: Duration::from_secs(90),
		}
	}
}

/// One execution slot: a loop that reserves queue entries, wins (or loses)
/// the registry claim, runs the engine on a blocking thread, and publishes
/// the outcome. Mutual exclusion across the fleet comes from the
/// Queued -> Processing CAS, never from the queue reservation.
pub struct Worker {
	id: String,
	registry: Arc<dyn JobRegistry>,
	queue: Arc<dyn WorkQueue>,
	cache: Arc<dyn ResultCache>,
	blobs: BlobStore,
	engine: Arc<dyn TranscriptionEngine>,
	settings: WorkerSettings,
}

enum Outcome {
	Executed,
	Skipped,
}

impl Worker {
	pub fn new(
		id: String,
		registry: Arc<dyn JobRegistry>,
		queue: Arc<dyn WorkQueue>,
		cache: Arc<dyn ResultCache>,
		blobs: BlobStore,
		engine: Arc<dyn TranscriptionEngine>,
		settings: WorkerSettings,
	) -> Self {
		Self {
			id,
			registry,
			queue,
			cache,
			blobs,
			engine,
			settings,
		}
	}

	/// Run until shutdown or until the self-recycle threshold is reached.
	/// Returning lets the supervising process restart the slot and bound
	/// memory growth; it is policy, not correctness.
	pub async fn run(&self, shutdown: CancellationToken) {
		info!(worker = %self.id, "worker slot started");
		let mut executed = 0u32;

		while !shutdown.is_cancelled() && executed < self.settings.jobs_before_restart {
			if let Err(e) = self.registry.record_heartbeat(&self.id, self.settings.heartbeat_ttl).await {
				warn!(worker = %self.id, error = %e, "heartbeat failed");
			}

			let polled = tokio::select! {
				_ = shutdown.cancelled() => break,
				polled = self.poll_once() => polled,
			};

			match polled {
				Ok(Some(Outcome::Executed)) => executed += 1,
				Ok(Some(Outcome::Skipped)) | Ok(None) => {}
				Err(e) => {
					error!(worker = %self.id, error = %e, "worker iteration failed, backing off");
					tokio::time::sleep(Duration::from_secs(1)).await;
				}
			}
		}

		info!(worker = %self.id, executed, "worker slot exiting");
	}

	/// One reserve/execute iteration. `None` means the queue stayed empty.
	async fn poll_once(&self) -> Result<Option<Outcome>, ScribeError> {
		let Some(job_id) = self.queue.reserve(self.settings.reserve_timeout).await? else {
			return Ok(None);
		};
		let outcome = self.execute(&job_id).await?;
		Ok(Some(outcome))
	}

	async fn execute(&self, job_id: &str) -> Result<Outcome, ScribeError> {
		// The reservation authorizes nothing; the CAS below does.
		let current = match self.registry.get(job_id).await {
			Ok(record) => record,
			Err(ScribeError::NotFound) => {
				debug!(job_id, "reserved id has no record, dropping");
				self.queue.ack(job_id).await?;
				return Ok(Outcome::Skipped);
			}
			Err(e) => return Err(e),
		};

		let mut claimed = current.clone();
		claimed.state = JobState::Processing;
		claimed.started_at = Some(now_epoch_secs());
		claimed.attempt = current.attempt + 1;

		let claimed = match self.registry.compare_and_swap(job_id, JobState::Queued, claimed).await {
			Ok(record) => record,
			Err(ScribeError::StateMismatch { actual }) => {
				// Duplicate delivery, or a tombstone: someone else owns this id.
				debug!(job_id, %actual, "claim lost, skipping");
				self.queue.ack(job_id).await?;
				return Ok(Outcome::Skipped);
			}
			Err(ScribeError::NotFound) => {
				self.queue.ack(job_id).await?;
				return Ok(Outcome::Skipped);
			}
			Err(e) => return Err(e),
		};

		let _in_progress = InProgressGuard::new();
		info!(job_id, attempt = claimed.attempt, "job claimed");

		let audio = match self.blobs.open(job_id).await {
			Ok(bytes) => bytes,
			Err(ScribeError::BlobMissing) => {
				warn!(job_id, "blob missing at execution time");
				self.fail(&claimed, "BlobMissing", "uploaded audio is missing from the blob store").await?;
				return Ok(Outcome::Executed);
			}
			Err(e) => return Err(e),
		};

		let started = Instant::now();
		match self.run_engine(&claimed, audio).await {
			EngineOutcome::Done(transcript) => {
				let elapsed = started.elapsed();
				self.cache.put(&claimed.fingerprint, &transcript, self.settings.cache_ttl).await?;

				let mut completed = claimed.clone();
				completed.state = JobState::Completed;
				completed.finished_at = Some(now_epoch_secs());
				completed.result_handle = Some(claimed.fingerprint.clone());
				completed.error_kind = None;
				completed.error_message = None;
				completed.cancel_requested = false;

				match self.registry.compare_and_swap(&claimed.job_id, JobState::Processing, completed).await {
					Ok(_) => {
						metrics::TRANSCRIPTION_DURATION_SECONDS.observe(elapsed.as_secs_f64());
						info!(job_id, elapsed_secs = elapsed.as_secs_f64(), "job completed");
					}
					Err(e) => warn!(job_id, error = %e, "completion lost the state race"),
				}
				self.blobs.delete(job_id).await?;
				self.queue.ack(job_id).await?;
			}
			EngineOutcome::Cancelled => {
				let mut cancelled = claimed.clone();
				cancelled.state = JobState::Cancelled;
				cancelled.finished_at = Some(now_epoch_secs());
				cancelled.error_kind = None;
				cancelled.error_message = None;

				if let Err(e) = self.registry.compare_and_swap(&claimed.job_id, JobState::Processing, cancelled).await {
					debug!(job_id, error = %e, "cancel confirmation lost the state race");
				}
				info!(job_id, "job cancelled cooperatively");
				self.blobs.delete(job_id).await?;
				self.queue.ack(job_id).await?;
			}
			EngineOutcome::TimedOut => {
				warn!(job_id, ceiling_secs = self.settings.transcribe_timeout.as_secs(), "transcription hit the time ceiling");
				self.fail(&claimed, "Timeout", "transcription exceeded the time ceiling").await?;
			}
			EngineOutcome::Failed(err) => {
				if err.is_transient() && claimed.attempt < self.settings.max_attempts {
					warn!(job_id, attempt = claimed.attempt, error = %err, "transient failure, requeueing");
					let mut requeued = claimed.clone();
					requeued.state = JobState::Queued;
					match self.registry.compare_and_swap(&claimed.job_id, JobState::Processing, requeued).await {
						Ok(_) => self.queue.nack(job_id, true).await?,
						// Cancelled (or otherwise moved) while we decided: drop it.
						Err(_) => self.queue.ack(job_id).await?,
					}
				} else {
					error!(job_id, attempt = claimed.attempt, error = %err, "job failed");
					let (kind, message) = classify(&err);
					self.fail(&claimed, kind, &message).await?;
				}
			}
		}

		Ok(Outcome::Executed)
	}

	/// Drive the blocking engine call, watching for the cancellation
	/// tombstone (every `cancel_poll_interval`) and the hard time ceiling.
	async fn run_engine(&self, claimed: &JobRecord, audio: Vec<u8>) -> EngineOutcome {
		let cancel = CancellationToken::new();
		let engine = Arc::clone(&self.engine);
		let options = claimed.options.clone();
		let token = cancel.clone();
		let mut task = tokio::task::spawn_blocking(move || engine.transcribe(&audio, &options, &token));

		let deadline = Instant::now() + self.settings.transcribe_timeout;
		let mut poll = tokio::time::interval(self.settings.cancel_poll_interval);
		poll.tick().await; // first tick is immediate
		let mut timed_out = false;

		let result = loop {
			tokio::select! {
				joined = &mut task => {
					break match joined {
						Ok(result) => result,
						Err(e) => Err(EngineError::Failed(format!("engine task aborted: {e}"))),
					};
				}
				_ = tokio::time::sleep_until(deadline), if !timed_out => {
					timed_out = true;
					cancel.cancel();
				}
				_ = poll.tick() => {
					match self.registry.get(&claimed.job_id).await {
						Ok(record) if record.cancel_requested || record.state == JobState::Cancelled => cancel.cancel(),
						// Record reaped out from under us: stop wasting CPU.
						Err(ScribeError::NotFound) => cancel.cancel(),
						_ => {}
					}
				}
			}
		};

		match result {
			Ok(transcript) => EngineOutcome::Done(transcript),
			Err(EngineError::Cancelled) if timed_out => EngineOutcome::TimedOut,
			Err(EngineError::Cancelled) => EngineOutcome::Cancelled,
			Err(e) => EngineOutcome::Failed(e),
		}
	}

	/// Terminal failure: durable kind/message on the record, blob released.
	async fn fail(&self, claimed: &JobRecord, kind: &str, message: &str) -> Result<(), ScribeError> {
		let mut failed = claimed.clone();
		failed.state = JobState::Failed;
		failed.finished_at = Some(now_epoch_secs());
		failed.error_kind = Some(kind.to_string());
		failed.error_message = Some(message.to_string());

		if let Err(e) = self.registry.compare_and_swap(&claimed.job_id, JobState::Processing, failed).await {
			warn!(job_id = %claimed.job_id, error = %e, "failure transition lost the state race");
		}
		self.blobs.delete(&claimed.job_id).await?;
		self.queue.ack(&claimed.job_id).await?;
		Ok(())
	}
}

enum EngineOutcome {
	Done(crate::job::Transcript),
	Cancelled,
	TimedOut,
	Failed(EngineError),
}

fn classify(err: &EngineError) -> (&'static str, String) {
	match err {
		EngineError::Decode(m) => ("DecodeError", m.clone()),
		EngineError::Io(e) => ("IOError", e.to_string()),
		EngineError::Failed(m) => ("EngineError", m.clone()),
		EngineError::Cancelled => ("Cancelled", String::new()),
	}
}

struct InProgressGuard;

impl InProgressGuard {
	fn new() -> Self {
		metrics::TRANSCRIPTION_IN_PROGRESS.inc();
		Self
	}
}

impl Drop for InProgressGuard {
	fn drop(&mut self) {
		metrics::TRANSCRIPTION_IN_PROGRESS.dec();
	}
}
