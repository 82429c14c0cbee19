use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt::format::JsonFields, util::SubscriberInitExt, Layer};

use scribe_core::{Config, Janitor, Worker};
use scribe_api::{build_state, router};

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	let config = Config::parse();
	config.validate().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
	let _ = init_tracing(&config);

	let config = Arc::new(config);
	let state = build_state(Arc::clone(&config)).await?;

	tracing::info!(
		version = env!("CARGO_PKG_VERSION"),
		backend = config.queue_backend_url.as_deref().unwrap_or("memory"),
		upload_dir = %config.upload_dir,
		"starting transcription service"
	);

	let shutdown = CancellationToken::new();

	let janitor = Janitor::new(Arc::clone(&state.registry), Arc::clone(&state.queue), state.blobs.clone(), config.janitor_settings());
	let janitor_handle = {
		let token = shutdown.clone();
		tokio::spawn(async move { janitor.run(token).await })
	};

	// Without an external backing the queue is process-local, so the worker
	// slots must live here too.
	let mut worker_handles = Vec::new();
	if config.queue_backend_url.is_none() {
		let engine = config.build_engine();
		for slot in 0..config.worker_concurrency {
			let worker = Worker::new(
				format!("api-{}-{slot}", std::process::id()),
				Arc::clone(&state.registry),
				Arc::clone(&state.queue),
				Arc::clone(&state.cache),
				state.blobs.clone(),
				Arc::clone(&engine),
				config.worker_settings(),
			);
			let token = shutdown.clone();
			worker_handles.push(tokio::spawn(async move {
				// Recycle the slot in place until shutdown.
				while !token.is_cancelled() {
					worker.run(token.clone()).await;
				}
			}));
		}
	}

	let app = router(state);
	let bind_addr = format!("{}:{}", config.host, config.port);
	let listener = TcpListener::bind(&bind_addr).await?;
	tracing::info!("listening on {}", listener.local_addr()?);
	let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

	tokio::select! {
		result = server => {
			if let Err(e) = result {
				tracing::error!("Server error: {}", e);
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("Received shutdown signal");
		}
	}

	tracing::info!("Shutting down...");
	shutdown.cancel();
	let _ = janitor_handle.await;
	for handle in worker_handles {
		let _ = handle.await;
	}

	Ok(())
}

#[must_use]
pub fn init_tracing(config: &Config) -> Option<()> {
	use std::str::FromStr;
	use tracing_subscriber::layer::SubscriberExt;

	let filter = EnvFilter::from_str(config.rust_log.as_deref().unwrap_or("scribe_core=info,scribe_api=info,info")).ok()?;

	tracing_subscriber::registry()
		.with(if config.log_json {
			Box::new(
				tracing_subscriber::fmt::layer()
					.fmt_fields(JsonFields::default())
					.event_format(tracing_subscriber::fmt::format().json().flatten_event(true).with_span_list(false))
					.with_filter(filter),
			) as Box<dyn Layer<_> + Send + Sync>
		} else {
			Box::new(tracing_subscriber::fmt::layer().with_filter(filter))
		})
		.init();
	Some(())
}
