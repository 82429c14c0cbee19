use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scribe_core::{BlobStore, Config, JobRegistry, RedisCache, RedisQueue, RedisRegistry, ResultCache, WorkQueue, Worker};

const BACKEND_MAX_RETRIES: u32 = 5;
const BACKEND_INITIAL_BACKOFF_MS: u64 = 500;

#[tokio::main]
async fn main() -> Result<()> {
	dotenvy::dotenv().ok();

	let config = Config::parse();
	config.validate().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
	init_tracing(&config);

	let backend_url = config
		.queue_backend_url
		.clone()
		.ok_or_else(|| anyhow::anyhow!("QUEUE_BACKEND_URL must be set for a dedicated worker process"))?;

	info!(
		service = "scribe-worker",
		slots = config.worker_concurrency,
		model = %config.model_size,
		device = %config.device,
		"🎯 Starting transcription worker"
	);

	let registry: Arc<dyn JobRegistry> = Arc::new(connect_with_retry(&backend_url, RedisRegistry::connect).await?);
	let queue: Arc<dyn WorkQueue> = Arc::new(connect_with_retry(&backend_url, RedisQueue::connect).await?);
	let cache: Arc<dyn ResultCache> = Arc::new(connect_with_retry(&backend_url, RedisCache::connect).await?);
	let blobs = BlobStore::open_root(config.upload_dir.clone(), config.max_file_size_bytes()).await?;
	let engine = config.build_engine();

	let shutdown = CancellationToken::new();

	// Liveness and process-local metrics for the scraper.
	let metrics_addr = format!("{}:{}", config.host, config.metrics_port);
	let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
	info!(addr = %metrics_addr, "metrics listener up");
	let metrics_app = Router::new()
		.route("/metrics", get(|| async { scribe_core::metrics::render().unwrap_or_default() }))
		.route("/healthz", get(|| async { "ok" }));
	let metrics_handle = tokio::spawn(async move {
		if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
			error!(error = %e, "metrics listener failed");
		}
	});

	let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
	let mut slot_handles = Vec::new();
	for slot in 0..config.worker_concurrency {
		let worker = Worker::new(
			format!("{host}-{}-{slot}", std::process::id()),
			Arc::clone(&registry),
			Arc::clone(&queue),
			Arc::clone(&cache),
			blobs.clone(),
			Arc::clone(&engine),
			config.worker_settings(),
		);
		let token = shutdown.clone();
		slot_handles.push(tokio::spawn(async move {
			// The slot self-recycles after its job budget; restart it in
			// place until shutdown.
			while !token.is_cancelled() {
				worker.run(token.clone()).await;
			}
		}));
	}

	wait_for_shutdown_signal().await;
	info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");
	shutdown.cancel();

	for handle in slot_handles {
		if let Err(e) = handle.await {
			warn!(error = %e, "worker slot join failed");
		}
	}
	metrics_handle.abort();

	info!("✅ Worker exiting");
	Ok(())
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

async fn connect_with_retry<T, F>(url: &str, connect: F) -> Result<T>
where
	F: Fn(&str) -> Result<T, scribe_core::ScribeError>,
{
	for attempt in 1..=BACKEND_MAX_RETRIES {
		match connect(url) {
			Ok(conn) => {
				info!(url, "✅ Connected to queue backend");
				return Ok(conn);
			}
			Err(e) => {
				if attempt == BACKEND_MAX_RETRIES {
					error!(error = %e, url, "backend connection failed after {} attempts - worker cannot continue", BACKEND_MAX_RETRIES);
					return Err(e.into());
				}

				let backoff = BACKEND_INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
				warn!(attempt, backoff_ms = backoff, error = %e, "backend connection failed, retrying...");
				tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
			}
		}
	}

	unreachable!()
}

fn init_tracing(config: &Config) {
	use tracing_subscriber::layer::SubscriberExt;
	use tracing_subscriber::util::SubscriberInitExt;

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| config.rust_log.clone().unwrap_or_else(|| "scribe_core=info,info".into()).into()))
		.with(tracing_subscriber::fmt::layer())
		.init();
}
