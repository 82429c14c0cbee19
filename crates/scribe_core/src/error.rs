use crate::job::JobState;

/// Service-wide error taxonomy. Every variant maps to a stable kind string
/// surfaced to clients and stored on failed job records; the HTTP layer owns
/// the status-code mapping.
#[derive(Debug, thiserror::Error)]
pub enum ScribeError {
	#[error("rate limit exceeded, retry in {retry_after}s")]
	RateLimited { retry_after: u64 },

	#[error("payload exceeds the {limit_mb} MB cap")]
	PayloadTooLarge { limit_mb: u64 },

	#[error("unsupported media type: {0}")]
	UnsupportedMedia(String),

	#[error("{0}")]
	BadRequest(String),

	#[error("unrecognized submission option: {0}")]
	UnknownOption(String),

	#[error("no such job")]
	NotFound,

	#[error("result is no longer available")]
	Gone,

	#[error("job is not cancellable in state {state}")]
	NotCancellable { state: JobState },

	#[error("job state changed concurrently (now {actual})")]
	StateMismatch { actual: JobState },

	#[error("job already exists: {0}")]
	Conflict(String),

	#[error("uploaded audio is missing from the blob store")]
	BlobMissing,

	#[error("audio could not be decoded: {0}")]
	DecodeError(String),

	#[error("transcription engine failed: {0}")]
	EngineError(String),

	#[error("transcription exceeded the time ceiling")]
	Timeout,

	#[error("job was cancelled")]
	Cancelled,

	#[error("i/o failure: {0}")]
	IoError(#[from] std::io::Error),

	#[error("work queue unavailable: {0}")]
	QueueUnavailable(String),

	#[error("job registry unavailable: {0}")]
	RegistryUnavailable(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ScribeError {
	/// Stable kind identifier, part of the client contract.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::RateLimited { .. } => "RateLimited",
			Self::PayloadTooLarge { .. } => "PayloadTooLarge",
			Self::UnsupportedMedia(_) => "UnsupportedMedia",
			Self::BadRequest(_) => "BadRequest",
			Self::UnknownOption(_) => "UnknownOption",
			Self::NotFound => "NotFound",
			Self::Gone => "Gone",
			Self::NotCancellable { .. } => "NotCancellable",
			Self::StateMismatch { .. } => "StateMismatch",
			Self::Conflict(_) => "Conflict",
			Self::BlobMissing => "BlobMissing",
			Self::DecodeError(_) => "DecodeError",
			Self::EngineError(_) => "EngineError",
			Self::Timeout => "Timeout",
			Self::Cancelled => "Cancelled",
			Self::IoError(_) => "IOError",
			Self::QueueUnavailable(_) => "QueueUnavailable",
			Self::RegistryUnavailable(_) => "RegistryUnavailable",
			Self::Internal(_) => "Internal",
		}
	}

	/// Suggested retry delay, present only on throttling errors.
	pub fn retry_after(&self) -> Option<u64> {
		match self {
			Self::RateLimited { retry_after } => Some(*retry_after),
			_ => None,
		}
	}

	/// Message safe to show a client: no paths, no backtraces.
	pub fn public_message(&self) -> String {
		match self {
			Self::IoError(_) => "an i/o failure occurred".to_string(),
			Self::Internal(_) => "an internal error occurred".to_string(),
			Self::QueueUnavailable(_) => "the work queue is unavailable".to_string(),
			Self::RegistryUnavailable(_) => "the job registry is unavailable".to_string(),
			other => other.to_string(),
		}
	}
}

impl From<serde_json::Error> for ScribeError {
	fn from(e: serde_json::Error) -> Self {
		Self::Internal(format!("serialization failed: {e}"))
	}
}
