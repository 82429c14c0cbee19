use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle states of a transcription job.
///
/// Legal transitions: Queued -> Processing -> {Completed, Failed}, and
/// {Queued, Processing} -> Cancelled. Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
	Queued,
	Processing,
	Completed,
	Failed,
	Cancelled,
}

impl JobState {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}

	/// Whether `self -> next` is a legal edge of the state DAG.
	pub fn can_transition_to(self, next: JobState) -> bool {
		match (self, next) {
			(Self::Queued, Self::Processing) => true,
			(Self::Processing, Self::Completed) | (Self::Processing, Self::Failed) => true,
			// A requeued retry walks Processing back to Queued.
			(Self::Processing, Self::Queued) => true,
			(Self::Queued, Self::Cancelled) | (Self::Processing, Self::Cancelled) => true,
			// Setting the cancel flag keeps a Processing job in Processing.
			(Self::Processing, Self::Processing) => true,
			_ => false,
		}
	}
}

impl std::fmt::Display for JobState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::Queued => "Queued",
			Self::Processing => "Processing",
			Self::Completed => "Completed",
			Self::Failed => "Failed",
			Self::Cancelled => "Cancelled",
		};
		f.write_str(s)
	}
}

/// Submission options that materially affect transcription output.
/// All three participate in the content fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
	/// ISO 639-1 language override; empty means auto-detect
	#[serde(default)]
	pub language: String,

	/// Silence trimming toggle
	#[serde(default)]
	pub vad_filter: bool,

	/// Decoder bias prompt, at most 1 KiB
	#[serde(default)]
	pub initial_prompt: String,
}

impl SubmitOptions {
	pub const MAX_PROMPT_BYTES: usize = 1024;
}

/// One timed span of transcribed speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
	pub start: f64,
	pub end: f64,
	pub text: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub confidence: Option<f64>,
}

/// The immutable output of a transcription, stored in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
	pub language: String,
	pub language_probability: f64,
	/// Total audio duration in seconds
	pub duration: f64,
	/// Wall time the engine spent, in seconds
	pub processing_time: f64,
	pub text: String,
	pub segments: Vec<TranscriptSegment>,
}

/// Durable record of one job's lifecycle, serialized whole on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
	pub job_id: String,
	pub state: JobState,
	/// sha-256 hex of the uploaded bytes plus fingerprint-affecting options
	pub fingerprint: String,
	/// Sanitized basename of the uploaded file, informational only
	pub filename: String,
	/// Unix epoch seconds
	pub submitted_at: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started_at: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finished_at: Option<u64>,
	pub options: SubmitOptions,
	/// Incremented by each Queued -> Processing claim
	pub attempt: u32,
	/// Result cache key, present iff Completed
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result_handle: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_kind: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	/// Cooperative-cancellation flag observed by the executing worker
	#[serde(default)]
	pub cancel_requested: bool,
}

impl JobRecord {
	pub fn new(job_id: String, fingerprint: String, filename: String, options: SubmitOptions) -> Self {
		Self {
			job_id,
			state: JobState::Queued,
			fingerprint,
			filename,
			submitted_at: now_epoch_secs(),
			started_at: None,
			finished_at: None,
			options,
			attempt: 0,
			result_handle: None,
			error_kind: None,
			error_message: None,
			cancel_requested: false,
		}
	}

	/// A record enrolled directly as Completed from a warm cache hit.
	pub fn completed_from_cache(job_id: String, fingerprint: String, filename: String, options: SubmitOptions) -> Self {
		let now = now_epoch_secs();
		Self {
			result_handle: Some(fingerprint.clone()),
			state: JobState::Completed,
			finished_at: Some(now),
			..Self::new(job_id, fingerprint, filename, options)
		}
	}
}

/// Strip any path components from a client-supplied filename, keeping only a
/// safe basename. Control characters are dropped; an empty result falls back
/// to "upload".
pub fn sanitize_filename(raw: &str) -> String {
	let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
	let cleaned: String = base.chars().filter(|c| !c.is_control()).take(255).collect();
	let cleaned = cleaned.trim().to_string();
	if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
		"upload".to_string()
	} else {
		cleaned
	}
}

pub fn now_epoch_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
