use clap::Parser;

/// Runtime configuration shared by the API server and the worker processes.
///
/// Every knob is an environment variable first and a CLI flag second, so the
/// same binary runs unchanged in containers and on a laptop with a `.env`.
#[derive(Parser, Debug, Clone)]
#[command(name = "scribe")]
#[command(about = "Asynchronous audio transcription service", long_about = None)]
pub struct Config {
	/// Server bind host
	#[arg(long, env = "HOST", default_value = "0.0.0.0")]
	pub host: String,

	/// Server bind port
	#[arg(long, env = "PORT", default_value = "8000")]
	pub port: u16,

	/// Use JSON formatting for tracing
	#[arg(long, env = "LOG_JSON", default_value = "false")]
	pub log_json: bool,

	/// Log filter, e.g. "scribe_core=debug,info"
	#[arg(long, env = "RUST_LOG")]
	pub rust_log: Option<String>,

	/// Submission size cap in megabytes
	#[arg(long, env = "MAX_FILE_SIZE_MB", default_value = "100")]
	pub max_file_size_mb: u64,

	/// Blob store root directory
	#[arg(long, env = "UPLOAD_DIR", default_value = "./uploads")]
	pub upload_dir: String,

	/// Result cache entry lifetime in seconds
	#[arg(long, env = "CACHE_TTL_SECONDS", default_value = "3600")]
	pub cache_ttl_seconds: u64,

	/// Job record retention past finished_at, in seconds
	#[arg(long, env = "JOB_RETENTION_SECONDS", default_value = "86400")]
	pub job_retention_seconds: u64,

	/// Connection string for the registry/queue backing store.
	/// Unset means a single-process in-memory backing with in-process workers.
	#[arg(long, env = "QUEUE_BACKEND_URL")]
	pub queue_backend_url: Option<String>,

	/// Execution slots per worker process
	#[arg(long, env = "WORKER_CONCURRENCY", default_value = "2")]
	pub worker_concurrency: usize,

	/// Jobs a worker slot executes before recycling itself
	#[arg(long, env = "WORKER_JOBS_BEFORE_RESTART", default_value = "50")]
	pub worker_jobs_before_restart: u32,

	/// Hard ceiling per transcription, in seconds
	#[arg(long, env = "TRANSCRIBE_TIMEOUT_SECONDS", default_value = "600")]
	pub transcribe_timeout_seconds: u64,

	/// Submission bucket refill rate, tokens per minute
	#[arg(long, env = "SUBMIT_RATE_PER_MIN", default_value = "10")]
	pub submit_rate_per_min: u32,

	/// Polling bucket refill rate, tokens per minute
	#[arg(long, env = "POLL_RATE_PER_MIN", default_value = "60")]
	pub poll_rate_per_min: u32,

	/// Retry cap before a transiently failing job goes to Failed
	#[arg(long, env = "MAX_ATTEMPTS", default_value = "3")]
	pub max_attempts: u32,

	/// Queue reserve poll timeout per worker iteration, in seconds
	#[arg(long, env = "RESERVE_TIMEOUT_SECONDS", default_value = "5")]
	pub reserve_timeout_seconds: u64,

	/// Port for the worker's own metrics/liveness listener
	#[arg(long, env = "METRICS_PORT", default_value = "9090")]
	pub metrics_port: u16,

	/// Transcription model identifier handed to the engine
	#[arg(long, env = "MODEL_SIZE", default_value = "base")]
	pub model_size: String,

	/// Compute device handed to the engine (cpu, cuda)
	#[arg(long, env = "DEVICE", default_value = "cpu")]
	pub device: String,

	/// Numeric precision handed to the engine (int8, float16, float32)
	#[arg(long, env = "COMPUTE_TYPE", default_value = "int8")]
	pub compute_type: String,

	/// External transcriber command; when unset the canned mock engine is used
	#[arg(long, env = "ENGINE_COMMAND")]
	pub engine_command: Option<String>,
}

impl Config {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.max_file_size_mb == 0 {
			return Err("MAX_FILE_SIZE_MB must be greater than 0".to_string());
		}

		if self.worker_concurrency == 0 {
			return Err("WORKER_CONCURRENCY must be at least 1".to_string());
		}

		if self.transcribe_timeout_seconds == 0 {
			return Err("TRANSCRIBE_TIMEOUT_SECONDS must be greater than 0".to_string());
		}

		if self.submit_rate_per_min == 0 || self.poll_rate_per_min == 0 {
			return Err("rate limits must be greater than 0 tokens per minute".to_string());
		}

		if self.max_attempts == 0 {
			return Err("MAX_ATTEMPTS must be at least 1".to_string());
		}

		Ok(())
	}

	/// Submission cap in bytes
	pub fn max_file_size_bytes(&self) -> u64 {
		self.max_file_size_mb * 1024 * 1024
	}

	pub fn worker_settings(&self) -> crate::worker::WorkerSettings {
		crate::worker::WorkerSettings {
			reserve_timeout: std::time::Duration::from_secs(self.reserve_timeout_seconds),
			transcribe_timeout: std::time::Duration::from_secs(self.transcribe_timeout_seconds),
			max_attempts: self.max_attempts,
			jobs_before_restart: self.worker_jobs_before_restart,
			cache_ttl: std::time::Duration::from_secs(self.cache_ttl_seconds),
			..Default::default()
		}
	}

	pub fn janitor_settings(&self) -> crate::janitor::JanitorSettings {
		crate::janitor::JanitorSettings {
			retention: std::time::Duration::from_secs(self.job_retention_seconds),
			orphan_after: std::time::Duration::from_secs(self.transcribe_timeout_seconds * 2),
			..Default::default()
		}
	}

	pub fn engine_config(&self) -> crate::engine::EngineConfig {
		crate::engine::EngineConfig {
			model: self.model_size.clone(),
			device: self.device.clone(),
			precision: self.compute_type.clone(),
		}
	}

	/// Instantiate the configured engine: an external command when
	/// `ENGINE_COMMAND` is set, the canned mock otherwise.
	pub fn build_engine(&self) -> std::sync::Arc<dyn crate::engine::TranscriptionEngine> {
		match &self.engine_command {
			Some(program) => std::sync::Arc::new(crate::engine::CommandEngine::new(program.clone(), self.engine_config())),
			None => {
				tracing::warn!("no ENGINE_COMMAND configured, using the canned mock engine");
				std::sync::Arc::new(crate::engine::MockEngine::canned())
			}
		}
	}
}
