use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::job::{SubmitOptions, Transcript};

/// Engine instantiation parameters, fixed for the lifetime of a worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub model: String,
	pub device: String,
	pub precision: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	#[error("transcription was cancelled")]
	Cancelled,

	#[error("audio could not be decoded: {0}")]
	Decode(String),

	#[error("engine failed: {0}")]
	Failed(String),

	#[error("engine i/o failure: {0}")]
	Io(#[from] std::io::Error),
}

impl EngineError {
	/// Whether a retry has any chance of succeeding.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Decode(_) | Self::Io(_))
	}
}

/// The opaque transcription callable. Blocking; safe to call serially within
/// one worker slot. Implementations must return promptly once `cancel` trips.
pub trait TranscriptionEngine: Send + Sync {
	fn transcribe(&self, audio: &[u8], options: &SubmitOptions, cancel: &CancellationToken) -> Result<Transcript, EngineError>;
}

// ---------------------------------------------------------------------------
// Canned engine
// ---------------------------------------------------------------------------

/// Deterministic engine for tests and memory-backed smoke deployments:
/// returns a fixed transcript, optionally after a cancellable delay, and can
/// be primed to fail transiently a number of times.
pub struct MockEngine {
	transcript: Transcript,
	delay: Duration,
	transient_failures: AtomicU32,
}

impl MockEngine {
	pub fn new(transcript: Transcript) -> Self {
		Self {
			transcript,
			delay: Duration::ZERO,
			transient_failures: AtomicU32::new(0),
		}
	}

	pub fn canned() -> Self {
		Self::new(Transcript {
			language: "en".into(),
			language_probability: 0.99,
			duration: 1.2,
			processing_time: 0.01,
			text: "canned transcript".into(),
			segments: vec![crate::job::TranscriptSegment {
				start: 0.0,
				end: 1.2,
				text: "canned transcript".into(),
				confidence: Some(-0.1),
			}],
		})
	}

	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}

	/// Fail the next `n` calls with a transient decode error.
	pub fn failing_times(self, n: u32) -> Self {
		self.transient_failures.store(n, Ordering::Relaxed);
		self
	}
}

impl TranscriptionEngine for MockEngine {
	fn transcribe(&self, _audio: &[u8], _options: &SubmitOptions, cancel: &CancellationToken) -> Result<Transcript, EngineError> {
		let deadline = Instant::now() + self.delay;
		while Instant::now() < deadline {
			if cancel.is_cancelled() {
				return Err(EngineError::Cancelled);
			}
			std::thread::sleep(Duration::from_millis(5));
		}
		if cancel.is_cancelled() {
			return Err(EngineError::Cancelled);
		}

		let remaining = self.transient_failures.load(Ordering::Relaxed);
		if remaining > 0 {
			self.transient_failures.store(remaining - 1, Ordering::Relaxed);
			return Err(EngineError::Decode("injected transient failure".into()));
		}

		Ok(self.transcript.clone())
	}
}

// ---------------------------------------------------------------------------
// External-process engine
// ---------------------------------------------------------------------------

/// Runs an external transcriber command against a temp file and parses the
/// transcript from its JSON stdout. The child is killed when `cancel` trips.
pub struct CommandEngine {
	program: String,
	config: EngineConfig,
}

impl CommandEngine {
	pub fn new(program: String, config: EngineConfig) -> Self {
		Self { program, config }
	}
}

impl TranscriptionEngine for CommandEngine {
	fn transcribe(&self, audio: &[u8], options: &SubmitOptions, cancel: &CancellationToken) -> Result<Transcript, EngineError> {
		let scratch = std::env::temp_dir().join(format!("scribe-engine-{}", uuid::Uuid::new_v4()));
		std::fs::write(&scratch, audio)?;

		let run = (|| {
			let mut cmd = Command::new(&self.program);
			cmd.arg("--model")
				.arg(&self.config.model)
				.arg("--device")
				.arg(&self.config.device)
				.arg("--compute-type")
				.arg(&self.config.precision);
			if !options.language.is_empty() {
				cmd.arg("--language").arg(&options.language);
			}
			if options.vad_filter {
				cmd.arg("--vad-filter");
			}
			if !options.initial_prompt.is_empty() {
				cmd.arg("--initial-prompt").arg(&options.initial_prompt);
			}
			cmd.arg(&scratch);
			cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

			let mut child = cmd.spawn()?;
			let status = loop {
				if cancel.is_cancelled() {
					let _ = child.kill();
					let _ = child.wait();
					return Err(EngineError::Cancelled);
				}
				match child.try_wait()? {
					Some(status) => break status,
					None => std::thread::sleep(Duration::from_millis(50)),
				}
			};

			let output = child.wait_with_output()?;
			if !status.success() {
				let stderr = String::from_utf8_lossy(&output.stderr);
				return Err(EngineError::Failed(format!("exit status {status}: {}", stderr.trim())));
			}

			debug!(bytes = output.stdout.len(), "engine produced output");
			serde_json::from_slice::<Transcript>(&output.stdout).map_err(|e| EngineError::Decode(format!("bad engine output: {e}")))
		})();

		let _ = std::fs::remove_file(&scratch);
		run
	}
}
