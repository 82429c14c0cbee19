use lazy_static::lazy_static;
use prometheus::{register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder};

lazy_static! {
	/// Submissions by outcome: submitted (enqueued), cached (warm hit), rejected.
	pub static ref TRANSCRIPTION_REQUESTS_TOTAL: IntCounterVec =
		register_int_counter_vec!("transcription_requests_total", "Total transcription submissions by outcome", &["outcome"]).expect("Failed to register TRANSCRIPTION_REQUESTS_TOTAL");

	/// Jobs currently held in Processing by this process.
	pub static ref TRANSCRIPTION_IN_PROGRESS: IntGauge =
		register_int_gauge!("transcription_in_progress", "Jobs currently being transcribed").expect("Failed to register TRANSCRIPTION_IN_PROGRESS");

	/// Observed at worker completion, successful jobs only.
	pub static ref TRANSCRIPTION_DURATION_SECONDS: Histogram = register_histogram!(
		"transcription_duration_seconds",
		"Wall time of completed transcriptions in seconds",
		vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
	)
	.expect("Failed to register TRANSCRIPTION_DURATION_SECONDS");

	/// Sampled by the janitor's depth loop.
	pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!("queue_depth", "Pending entries in the work queue").expect("Failed to register QUEUE_DEPTH");

	pub static ref CACHE_HITS_TOTAL: IntCounter =
		register_int_counter!("cache_hits_total", "Result cache hits at submission").expect("Failed to register CACHE_HITS_TOTAL");

	pub static ref CACHE_MISSES_TOTAL: IntCounter =
		register_int_counter!("cache_misses_total", "Result cache misses at submission").expect("Failed to register CACHE_MISSES_TOTAL");
}

/// Submission outcome labels for `transcription_requests_total`.
pub mod outcome {
	pub const SUBMITTED: &str = "submitted";
	pub const CACHED: &str = "cached";
	pub const REJECTED: &str = "rejected";
}

/// Render every registered metric in text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
	// The statics register on first touch; make sure every normative series
	// exists in the exposition even before its first observation.
	lazy_static::initialize(&TRANSCRIPTION_REQUESTS_TOTAL);
	lazy_static::initialize(&TRANSCRIPTION_IN_PROGRESS);
	lazy_static::initialize(&TRANSCRIPTION_DURATION_SECONDS);
	lazy_static::initialize(&QUEUE_DEPTH);
	lazy_static::initialize(&CACHE_HITS_TOTAL);
	lazy_static::initialize(&CACHE_MISSES_TOTAL);

	let encoder = TextEncoder::new();
	let metric_families = prometheus::gather();
	let mut buffer = Vec::new();
	encoder.encode(&metric_families, &mut buffer)?;
	Ok(String::from_utf8(buffer).unwrap_or_default())
}
