use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ScribeError;

const PENDING_KEY: &str = "scribe:queue:pending";
const CLAIMED_KEY: &str = "scribe:queue:claimed";

/// FIFO queue of job ids pending execution.
///
/// Delivery is at-least-once: a reserved id stays on a claim ledger until it
/// is acked or nacked, so a crashed worker leaves a trace instead of losing
/// the entry. Duplicate delivery is harmless because execution is authorized
/// by the registry CAS, not by the reservation.
#[async_trait]
pub trait WorkQueue: Send + Sync {
	async fn push(&self, job_id: &str) -> Result<(), ScribeError>;

	/// Block up to `timeout` for the next id. `None` means the queue stayed
	/// empty, which is the normal idle outcome, not an error.
	async fn reserve(&self, timeout: Duration) -> Result<Option<String>, ScribeError>;

	/// Finalize a delivery.
	async fn ack(&self, job_id: &str) -> Result<(), ScribeError>;

	/// Return (`requeue = true`, tail position) or drop a delivery.
	async fn nack(&self, job_id: &str, requeue: bool) -> Result<(), ScribeError>;

	/// Number of ids waiting (claimed entries excluded).
	async fn depth(&self) -> Result<usize, ScribeError>;

	async fn ping(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-process backing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryQueueInner {
	pending: VecDeque<String>,
	claimed: Vec<String>,
}

/// Single-process queue used by tests and memory-backed deployments.
#[derive(Default)]
pub struct MemoryQueue {
	inner: Mutex<MemoryQueueInner>,
	notify: Notify,
}

impl MemoryQueue {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl WorkQueue for MemoryQueue {
	async fn push(&self, job_id: &str) -> Result<(), ScribeError> {
		self.inner.lock().expect("queue lock").pending.push_back(job_id.to_string());
		self.notify.notify_one();
		Ok(())
	}

	async fn reserve(&self, timeout: Duration) -> Result<Option<String>, ScribeError> {
		let deadline = Instant::now() + timeout;
		loop {
			{
				let mut inner = self.inner.lock().expect("queue lock");
				if let Some(id) = inner.pending.pop_front() {
					inner.claimed.push(id.clone());
					return Ok(Some(id));
				}
			}
			let now = Instant::now();
			if now >= deadline {
				return Ok(None);
			}
			tokio::select! {
				_ = self.notify.notified() => {}
				_ = tokio::time::sleep_until(deadline) => return Ok(None),
			}
		}
	}

	async fn ack(&self, job_id: &str) -> Result<(), ScribeError> {
		let mut inner = self.inner.lock().expect("queue lock");
		inner.claimed.retain(|id| id != job_id);
		Ok(())
	}

	async fn nack(&self, job_id: &str, requeue: bool) -> Result<(), ScribeError> {
		let mut inner = self.inner.lock().expect("queue lock");
		inner.claimed.retain(|id| id != job_id);
		if requeue {
			inner.pending.push_back(job_id.to_string());
			drop(inner);
			self.notify.notify_one();
		}
		Ok(())
	}

	async fn depth(&self) -> Result<usize, ScribeError> {
		Ok(self.inner.lock().expect("queue lock").pending.len())
	}

	async fn ping(&self) -> bool {
		true
	}
}

// ---------------------------------------------------------------------------
// Redis backing
// ---------------------------------------------------------------------------

/// Redis list pair: `BLMOVE` atomically shifts the head of the pending list
/// onto the claim ledger, where ack/nack `LREM` it away.
#[derive(Clone)]
pub struct RedisQueue {
	client: redis::Client,
}

impl RedisQueue {
	pub fn connect(url: &str) -> Result<Self, ScribeError> {
		let client = redis::Client::open(url).map_err(queue_err)?;
		Ok(Self { client })
	}

	async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, ScribeError> {
		self.client.get_multiplexed_async_connection().await.map_err(queue_err)
	}
}

fn queue_err(e: redis::RedisError) -> ScribeError {
	ScribeError::QueueUnavailable(e.to_string())
}

#[async_trait]
impl WorkQueue for RedisQueue {
	async fn push(&self, job_id: &str) -> Result<(), ScribeError> {
		let mut conn = self.conn().await?;
		let _: () = conn.rpush(PENDING_KEY, job_id).await.map_err(queue_err)?;
		Ok(())
	}

	async fn reserve(&self, timeout: Duration) -> Result<Option<String>, ScribeError> {
		// Dedicated connection per reserve: a blocking command would stall
		// every other caller multiplexed onto a shared one.
		let mut conn = self.conn().await?;
		let reserved: Option<String> = redis::cmd("BLMOVE")
			.arg(PENDING_KEY)
			.arg(CLAIMED_KEY)
			.arg("LEFT")
			.arg("RIGHT")
			.arg(timeout.as_secs_f64())
			.query_async(&mut conn)
			.await
			.map_err(queue_err)?;
		Ok(reserved)
	}

	async fn ack(&self, job_id: &str) -> Result<(), ScribeError> {
		let mut conn = self.conn().await?;
		let _: () = conn.lrem(CLAIMED_KEY, 1, job_id).await.map_err(queue_err)?;
		Ok(())
	}

	async fn nack(&self, job_id: &str, requeue: bool) -> Result<(), ScribeError> {
		let mut conn = self.conn().await?;
		let _: () = conn.lrem(CLAIMED_KEY, 1, job_id).await.map_err(queue_err)?;
		if requeue {
			let _: () = conn.rpush(PENDING_KEY, job_id).await.map_err(queue_err)?;
		}
		Ok(())
	}

	async fn depth(&self) -> Result<usize, ScribeError> {
		let mut conn = self.conn().await?;
		let len: usize = conn.llen(PENDING_KEY).await.map_err(queue_err)?;
		Ok(len)
	}

	async fn ping(&self) -> bool {
		match self.conn().await {
			Ok(mut conn) => {
				let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
				pong.is_ok()
			}
			Err(_) => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn fifo_within_one_producer() {
		let q = MemoryQueue::new();
		q.push("a").await.unwrap();
		q.push("b").await.unwrap();
		q.push("c").await.unwrap();

		assert_eq!(q.reserve(Duration::from_millis(10)).await.unwrap().as_deref(), Some("a"));
		assert_eq!(q.reserve(Duration::from_millis(10)).await.unwrap().as_deref(), Some("b"));
		assert_eq!(q.reserve(Duration::from_millis(10)).await.unwrap().as_deref(), Some("c"));
	}

	#[tokio::test]
	async fn empty_reserve_times_out_with_none() {
		let q = MemoryQueue::new();
		let started = std::time::Instant::now();
		let got = q.reserve(Duration::from_millis(50)).await.unwrap();
		assert!(got.is_none());
		assert!(started.elapsed() >= Duration::from_millis(45), "reserve must block for the timeout");
	}

	#[tokio::test]
	async fn reserve_wakes_on_push() {
		let q = std::sync::Arc::new(MemoryQueue::new());
		let q2 = std::sync::Arc::clone(&q);
		let waiter = tokio::spawn(async move { q2.reserve(Duration::from_secs(5)).await.unwrap() });
		tokio::time::sleep(Duration::from_millis(20)).await;
		q.push("late").await.unwrap();
		assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
	}

	#[tokio::test]
	async fn nack_requeue_lands_at_the_tail() {
		let q = MemoryQueue::new();
		q.push("first").await.unwrap();
		q.push("second").await.unwrap();

		let got = q.reserve(Duration::from_millis(10)).await.unwrap().unwrap();
		assert_eq!(got, "first");
		q.nack("first", true).await.unwrap();

		assert_eq!(q.reserve(Duration::from_millis(10)).await.unwrap().as_deref(), Some("second"));
		assert_eq!(q.reserve(Duration::from_millis(10)).await.unwrap().as_deref(), Some("first"));
	}

	#[tokio::test]
	async fn nack_drop_discards() {
		let q = MemoryQueue::new();
		q.push("only").await.unwrap();
		q.reserve(Duration::from_millis(10)).await.unwrap().unwrap();
		q.nack("only", false).await.unwrap();
		assert!(q.reserve(Duration::from_millis(10)).await.unwrap().is_none());
		assert_eq!(q.depth().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn depth_counts_pending_not_claimed() {
		let q = MemoryQueue::new();
		q.push("a").await.unwrap();
		q.push("b").await.unwrap();
		assert_eq!(q.depth().await.unwrap(), 2);
		q.reserve(Duration::from_millis(10)).await.unwrap().unwrap();
		assert_eq!(q.depth().await.unwrap(), 1);
		q.ack("a").await.unwrap();
		assert_eq!(q.depth().await.unwrap(), 1);
	}

	// Requires a running Redis at REDIS_TEST_URL; exercised manually.
	#[tokio::test]
	#[ignore]
	async fn redis_reserve_ack_cycle() {
		let url = std::env::var("REDIS_TEST_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
		let q = RedisQueue::connect(&url).unwrap();
		let id = uuid::Uuid::new_v4().to_string();
		q.push(&id).await.unwrap();
		let got = q.reserve(Duration::from_secs(1)).await.unwrap();
		assert_eq!(got.as_deref(), Some(id.as_str()));
		q.ack(&id).await.unwrap();
	}
}
