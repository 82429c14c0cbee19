use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::error::ScribeError;
use crate::job::{now_epoch_secs, JobState};
use crate::metrics;
use crate::queue::WorkQueue;
use crate::registry::JobRegistry;

const LIST_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct JanitorSettings {
	pub blob_sweep_interval: Duration,
	/// Hard age cap after which a blob is deleted regardless of job state.
	pub blob_max_age: Duration,
	pub reap_interval: Duration,
	/// Retention past finished_at before a record is purged.
	pub retention: Duration,
	pub depth_interval: Duration,
	/// A Processing record older than this is considered orphaned by a dead
	/// worker and is walked back to Queued.
	pub orphan_after: Duration,
}

impl Default for JanitorSettings {
	fn default() -> Self {
		Self {
			blob_sweep_interval: Duration::from_secs(600),
			blob_max_age: Duration::from_secs(24 * 3600),
			reap_interval: Duration::from_secs(900),
			retention: Duration::from_secs(24 * 3600),
			depth_interval: Duration::from_secs(30),
			orphan_after: Duration::from_secs(2 * 600),
		}
	}
}

/// Periodic housekeeping: expired-blob sweeping, record retention, orphaned
/// Processing jobs, and queue depth sampling.
pub struct Janitor {
	registry: Arc<dyn JobRegistry>,
	queue: Arc<dyn WorkQueue>,
	blobs: BlobStore,
	settings: JanitorSettings,
}

impl Janitor {
	pub fn new(registry: Arc<dyn JobRegistry>, queue: Arc<dyn WorkQueue>, blobs: BlobStore, settings: JanitorSettings) -> Self {
		Self {
			registry,
			queue,
			blobs,
			settings,
		}
	}

	pub async fn run(&self, shutdown: CancellationToken) {
		info!("janitor started");
		let mut blob_tick = tokio::time::interval(self.settings.blob_sweep_interval);
		let mut reap_tick = tokio::time::interval(self.settings.reap_interval);
		let mut depth_tick = tokio::time::interval(self.settings.depth_interval);

		loop {
			tokio::select! {
				_ = shutdown.cancelled() => break,
				_ = blob_tick.tick() => {
					if let Err(e) = self.sweep_blobs_once().await {
						warn!(error = %e, "blob sweep failed");
					}
				}
				_ = reap_tick.tick() => {
					if let Err(e) = self.reap_once().await {
						warn!(error = %e, "job reap failed");
					}
				}
				_ = depth_tick.tick() => {
					if let Err(e) = self.sample_depth_once().await {
						warn!(error = %e, "depth sample failed");
					}
				}
			}
		}
		info!("janitor stopped");
	}

	/// Delete blobs belonging to terminal jobs, then force-delete anything
	/// older than the hard cap (covers jobs whose records are already gone).
	pub async fn sweep_blobs_once(&self) -> Result<usize, ScribeError> {
		let mut removed = 0usize;
		for state in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
			for record in self.registry.list_by_state(state, LIST_BATCH).await? {
				if self.blobs.path_for(&record.job_id).map(|p| p.exists()).unwrap_or(false) {
					self.blobs.delete(&record.job_id).await?;
					removed += 1;
				}
			}
		}
		removed += self.blobs.sweep(self.settings.blob_max_age).await?;
		if removed > 0 {
			info!(removed, "blob sweep finished");
		}
		Ok(removed)
	}

	/// Purge records past retention and walk orphaned Processing jobs back
	/// to Queued so another worker picks them up.
	pub async fn reap_once(&self) -> Result<usize, ScribeError> {
		let now = now_epoch_secs();
		let retention = self.settings.retention.as_secs();
		let mut reaped = 0usize;

		for state in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
			for record in self.registry.list_by_state(state, LIST_BATCH).await? {
				let expired = record.finished_at.map(|t| t + retention <= now).unwrap_or(false);
				if expired {
					self.registry.delete(&record.job_id).await?;
					self.blobs.delete(&record.job_id).await?;
					reaped += 1;
				}
			}
		}

		let orphan_after = self.settings.orphan_after.as_secs();
		for record in self.registry.list_by_state(JobState::Processing, LIST_BATCH).await? {
			let stale = record.started_at.map(|t| t + orphan_after <= now).unwrap_or(true);
			if !stale {
				continue;
			}
			let mut requeued = record.clone();
			requeued.state = JobState::Queued;
			match self.registry.compare_and_swap(&record.job_id, JobState::Processing, requeued).await {
				Ok(_) => {
					warn!(job_id = %record.job_id, "orphaned job walked back to Queued");
					// Drop the dead worker's claim before re-pushing.
					self.queue.nack(&record.job_id, false).await?;
					self.queue.push(&record.job_id).await?;
				}
				// The owning worker moved it first; nothing to do.
				Err(ScribeError::StateMismatch { .. }) | Err(ScribeError::NotFound) => {}
				Err(e) => return Err(e),
			}
		}

		if reaped > 0 {
			info!(reaped, "job reap finished");
		}
		Ok(reaped)
	}

	pub async fn sample_depth_once(&self) -> Result<(), ScribeError> {
		let depth = self.queue.depth().await?;
		metrics::QUEUE_DEPTH.set(depth as i64);
		debug!(depth, "queue depth sampled");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::{JobRecord, SubmitOptions};
	use crate::queue::MemoryQueue;
	use crate::registry::MemoryRegistry;

	struct Fixture {
		registry: Arc<MemoryRegistry>,
		queue: Arc<MemoryQueue>,
		blobs: BlobStore,
		_dir: tempfile::TempDir,
	}

	async fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let blobs = BlobStore::open_root(dir.path(), 1024).await.unwrap();
		Fixture {
			registry: Arc::new(MemoryRegistry::new()),
			queue: Arc::new(MemoryQueue::new()),
			blobs,
			_dir: dir,
		}
	}

	fn janitor(fx: &Fixture, settings: JanitorSettings) -> Janitor {
		Janitor::new(
			Arc::clone(&fx.registry) as Arc<dyn JobRegistry>,
			Arc::clone(&fx.queue) as Arc<dyn WorkQueue>,
			fx.blobs.clone(),
			settings,
		)
	}

	async fn put_blob(fx: &Fixture, job_id: &str) {
		let mut w = fx.blobs.writer(job_id).await.unwrap();
		w.write(b"x").await.unwrap();
		w.finish().await.unwrap();
	}

	#[tokio::test]
	async fn reaper_purges_only_expired_records() {
		let fx = fixture().await;

		let mut old = JobRecord::new("old".into(), "fp".into(), "a.wav".into(), SubmitOptions::default());
		old.state = JobState::Completed;
		old.finished_at = Some(now_epoch_secs() - 100);
		fx.registry.create(&old).await.unwrap();

		let mut fresh = JobRecord::new("fresh".into(), "fp".into(), "b.wav".into(), SubmitOptions::default());
		fresh.state = JobState::Failed;
		fresh.finished_at = Some(now_epoch_secs());
		fx.registry.create(&fresh).await.unwrap();

		let mut settings = JanitorSettings::default();
		settings.retention = Duration::from_secs(50);
		let j = janitor(&fx, settings);

		assert_eq!(j.reap_once().await.unwrap(), 1);
		assert_eq!(fx.registry.get("old").await.unwrap_err().kind(), "NotFound");
		assert!(fx.registry.get("fresh").await.is_ok());
	}

	#[tokio::test]
	async fn orphaned_processing_jobs_are_requeued() {
		let fx = fixture().await;

		let mut orphan = JobRecord::new("orphan".into(), "fp".into(), "a.wav".into(), SubmitOptions::default());
		orphan.state = JobState::Processing;
		orphan.started_at = Some(now_epoch_secs() - 5000);
		orphan.attempt = 1;
		fx.registry.create(&orphan).await.unwrap();

		let mut live = JobRecord::new("live".into(), "fp".into(), "b.wav".into(), SubmitOptions::default());
		live.state = JobState::Processing;
		live.started_at = Some(now_epoch_secs());
		fx.registry.create(&live).await.unwrap();

		let mut settings = JanitorSettings::default();
		settings.orphan_after = Duration::from_secs(1200);
		let j = janitor(&fx, settings);
		j.reap_once().await.unwrap();

		assert_eq!(fx.registry.get("orphan").await.unwrap().state, JobState::Queued);
		assert_eq!(fx.registry.get("live").await.unwrap().state, JobState::Processing);
		assert_eq!(fx.queue.depth().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn blob_sweep_releases_terminal_blobs() {
		let fx = fixture().await;

		let mut done = JobRecord::new("done".into(), "fp".into(), "a.wav".into(), SubmitOptions::default());
		done.state = JobState::Completed;
		done.finished_at = Some(now_epoch_secs());
		fx.registry.create(&done).await.unwrap();
		put_blob(&fx, "done").await;

		let queued = JobRecord::new("waiting".into(), "fp".into(), "b.wav".into(), SubmitOptions::default());
		fx.registry.create(&queued).await.unwrap();
		put_blob(&fx, "waiting").await;

		let j = janitor(&fx, JanitorSettings::default());
		let removed = j.sweep_blobs_once().await.unwrap();
		assert_eq!(removed, 1);
		assert!(matches!(fx.blobs.open("done").await, Err(ScribeError::BlobMissing)));
		assert!(fx.blobs.open("waiting").await.is_ok(), "queued blobs must survive the sweep");
	}

	#[tokio::test]
	async fn depth_sampler_updates_the_gauge() {
		let fx = fixture().await;
		fx.queue.push("a").await.unwrap();
		fx.queue.push("b").await.unwrap();

		let j = janitor(&fx, JanitorSettings::default());
		j.sample_depth_once().await.unwrap();
		assert_eq!(metrics::QUEUE_DEPTH.get(), 2);
	}
}
