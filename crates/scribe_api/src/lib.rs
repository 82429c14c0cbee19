pub mod error;
pub mod handlers;
pub mod metrics;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use scribe_core::{
	BlobStore, Config, JobRegistry, MemoryCache, MemoryQueue, MemoryRegistry, RateLimiter, RedisCache, RedisQueue, RedisRegistry, ResultCache, ScribeError, WorkQueue,
};

/// Everything a request handler needs, shared across the service.
#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub registry: Arc<dyn JobRegistry>,
	pub queue: Arc<dyn WorkQueue>,
	pub cache: Arc<dyn ResultCache>,
	pub blobs: BlobStore,
	pub limiter: Arc<RateLimiter>,
}

/// Wire the state against the configured backing: Redis when
/// `QUEUE_BACKEND_URL` is set, otherwise the single-process memory backing.
pub async fn build_state(config: Arc<Config>) -> Result<AppState, ScribeError> {
	let blobs = BlobStore::open_root(config.upload_dir.clone(), config.max_file_size_bytes()).await?;

	let (registry, queue, cache): (Arc<dyn JobRegistry>, Arc<dyn WorkQueue>, Arc<dyn ResultCache>) = match &config.queue_backend_url {
		Some(url) => (
			Arc::new(RedisRegistry::connect(url)?),
			Arc::new(RedisQueue::connect(url)?),
			Arc::new(RedisCache::connect(url)?),
		),
		None => (Arc::new(MemoryRegistry::new()), Arc::new(MemoryQueue::new()), Arc::new(MemoryCache::new())),
	};

	let limiter = Arc::new(RateLimiter::new(config.submit_rate_per_min, config.poll_rate_per_min));

	Ok(AppState {
		config,
		registry,
		queue,
		cache,
		blobs,
		limiter,
	})
}

pub fn router(state: AppState) -> Router {
	// The cap plus generous multipart framing headroom; the blob writer is
	// the byte-exact gate.
	let body_limit = (state.config.max_file_size_bytes() + 1024 * 1024) as usize;

	Router::new()
		.route("/", get(handlers::health::root))
		.route("/transcribe", post(handlers::submit::transcribe))
		.route("/status/:job_id", get(handlers::jobs::status))
		.route("/result/:job_id", get(handlers::jobs::result))
		.route("/job/:job_id", delete(handlers::jobs::cancel))
		.route("/health", get(handlers::health::health))
		.route("/stats", get(handlers::health::stats))
		.route("/metrics", get(metrics::metrics_handler))
		.layer(DefaultBodyLimit::max(body_limit))
		.layer(axum::middleware::from_fn(metrics::metrics_middleware))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}
