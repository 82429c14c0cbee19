use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::ScribeError;
use crate::job::{JobRecord, JobState};

const JOB_KEY_PREFIX: &str = "scribe:job:";
const JOB_INDEX_KEY: &str = "scribe:jobs";
const WORKER_KEY_PREFIX: &str = "scribe:worker:";

/// Durable mapping from job id to job record.
///
/// `compare_and_swap` is the sole mutation primitive after `create`: it
/// replaces the whole record only if the stored state still equals
/// `expected`, which is what enforces both the state DAG and the
/// at-most-one-dispatch rule (the Queued -> Processing CAS has one winner).
///
/// The registry backing doubles as the coordination store, so worker
/// liveness heartbeats live here too.
#[async_trait]
pub trait JobRegistry: Send + Sync {
	/// Insert a fresh record; `Conflict` if the id already exists.
	async fn create(&self, record: &JobRecord) -> Result<(), ScribeError>;

	async fn get(&self, job_id: &str) -> Result<JobRecord, ScribeError>;

	/// Replace the record iff its current state equals `expected`.
	/// Returns the stored record on success, `StateMismatch` with the actual
	/// state otherwise.
	async fn compare_and_swap(&self, job_id: &str, expected: JobState, new_record: JobRecord) -> Result<JobRecord, ScribeError>;

	/// Snapshot of records in `state`, at most `limit`. Janitor use only.
	async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, ScribeError>;

	/// Remove a record outright (retention reaper).
	async fn delete(&self, job_id: &str) -> Result<(), ScribeError>;

	async fn record_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), ScribeError>;

	/// Number of workers with a live heartbeat.
	async fn alive_workers(&self) -> Result<usize, ScribeError>;

	/// Whether the backing store answers at all.
	async fn ping(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-process backing
// ---------------------------------------------------------------------------

/// Single-process registry used by tests and memory-backed deployments.
#[derive(Default)]
pub struct MemoryRegistry {
	jobs: Mutex<HashMap<String, JobRecord>>,
	heartbeats: Mutex<HashMap<String, Instant>>,
}

impl MemoryRegistry {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
	async fn create(&self, record: &JobRecord) -> Result<(), ScribeError> {
		let mut jobs = self.jobs.lock().expect("registry lock");
		if jobs.contains_key(&record.job_id) {
			return Err(ScribeError::Conflict(record.job_id.clone()));
		}
		jobs.insert(record.job_id.clone(), record.clone());
		Ok(())
	}

	async fn get(&self, job_id: &str) -> Result<JobRecord, ScribeError> {
		self.jobs.lock().expect("registry lock").get(job_id).cloned().ok_or(ScribeError::NotFound)
	}

	async fn compare_and_swap(&self, job_id: &str, expected: JobState, new_record: JobRecord) -> Result<JobRecord, ScribeError> {
		let mut jobs = self.jobs.lock().expect("registry lock");
		let current = jobs.get(job_id).ok_or(ScribeError::NotFound)?;
		if current.state != expected {
			return Err(ScribeError::StateMismatch { actual: current.state });
		}
		jobs.insert(job_id.to_string(), new_record.clone());
		Ok(new_record)
	}

	async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, ScribeError> {
		let jobs = self.jobs.lock().expect("registry lock");
		Ok(jobs.values().filter(|r| r.state == state).take(limit).cloned().collect())
	}

	async fn delete(&self, job_id: &str) -> Result<(), ScribeError> {
		self.jobs.lock().expect("registry lock").remove(job_id);
		Ok(())
	}

	async fn record_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), ScribeError> {
		let expires = Instant::now() + ttl;
		self.heartbeats.lock().expect("heartbeat lock").insert(worker_id.to_string(), expires);
		Ok(())
	}

	async fn alive_workers(&self) -> Result<usize, ScribeError> {
		let now = Instant::now();
		let mut beats = self.heartbeats.lock().expect("heartbeat lock");
		beats.retain(|_, expires| *expires > now);
		Ok(beats.len())
	}

	async fn ping(&self) -> bool {
		true
	}
}

// ---------------------------------------------------------------------------
// Redis backing
// ---------------------------------------------------------------------------

/// Atomic compare-and-swap on the serialized record: the comparison of the
/// stored state and the overwrite happen inside one server-side script.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
	return 'missing'
end
local record = cjson.decode(current)
if record.state ~= ARGV[1] then
	return 'mismatch:' .. record.state
end
redis.call('SET', KEYS[1], ARGV[2])
return 'ok'
"#;

/// Redis-backed registry sharing the queue's connection string.
#[derive(Clone)]
pub struct RedisRegistry {
	client: redis::Client,
	cas: std::sync::Arc<redis::Script>,
}

impl RedisRegistry {
	pub fn connect(url: &str) -> Result<Self, ScribeError> {
		let client = redis::Client::open(url).map_err(reg_err)?;
		Ok(Self {
			client,
			cas: std::sync::Arc::new(redis::Script::new(CAS_SCRIPT)),
		})
	}

	async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, ScribeError> {
		self.client.get_multiplexed_async_connection().await.map_err(reg_err)
	}

	fn job_key(job_id: &str) -> String {
		format!("{JOB_KEY_PREFIX}{job_id}")
	}

	fn parse_state(raw: &str) -> JobState {
		match raw {
			"Processing" => JobState::Processing,
			"Completed" => JobState::Completed,
			"Failed" => JobState::Failed,
			"Cancelled" => JobState::Cancelled,
			_ => JobState::Queued,
		}
	}
}

fn reg_err(e: redis::RedisError) -> ScribeError {
	ScribeError::RegistryUnavailable(e.to_string())
}

#[async_trait]
impl JobRegistry for RedisRegistry {
	async fn create(&self, record: &JobRecord) -> Result<(), ScribeError> {
		let mut conn = self.conn().await?;
		let serialized = serde_json::to_string(record)?;
		let inserted: bool = conn.set_nx(Self::job_key(&record.job_id), serialized).await.map_err(reg_err)?;
		if !inserted {
			return Err(ScribeError::Conflict(record.job_id.clone()));
		}
		let _: () = conn.sadd(JOB_INDEX_KEY, &record.job_id).await.map_err(reg_err)?;
		Ok(())
	}

	async fn get(&self, job_id: &str) -> Result<JobRecord, ScribeError> {
		let mut conn = self.conn().await?;
		let raw: Option<String> = conn.get(Self::job_key(job_id)).await.map_err(reg_err)?;
		match raw {
			Some(s) => Ok(serde_json::from_str(&s)?),
			None => Err(ScribeError::NotFound),
		}
	}

	async fn compare_and_swap(&self, job_id: &str, expected: JobState, new_record: JobRecord) -> Result<JobRecord, ScribeError> {
		let mut conn = self.conn().await?;
		let serialized = serde_json::to_string(&new_record)?;
		let verdict: String = self
			.cas
			.key(Self::job_key(job_id))
			.arg(expected.to_string())
			.arg(serialized)
			.invoke_async(&mut conn)
			.await
			.map_err(reg_err)?;
		match verdict.as_str() {
			"ok" => Ok(new_record),
			"missing" => Err(ScribeError::NotFound),
			other => {
				let actual = other.strip_prefix("mismatch:").unwrap_or("Queued");
				Err(ScribeError::StateMismatch {
					actual: Self::parse_state(actual),
				})
			}
		}
	}

	async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, ScribeError> {
		let mut conn = self.conn().await?;
		let ids: Vec<String> = conn.smembers(JOB_INDEX_KEY).await.map_err(reg_err)?;
		let mut out = Vec::new();
		for id in ids {
			if out.len() >= limit {
				break;
			}
			let raw: Option<String> = conn.get(Self::job_key(&id)).await.map_err(reg_err)?;
			match raw {
				Some(s) => {
					if let Ok(record) = serde_json::from_str::<JobRecord>(&s) {
						if record.state == state {
							out.push(record);
						}
					}
				}
				// Index entry without a record: reap the dangling id.
				None => {
					let _: () = conn.srem(JOB_INDEX_KEY, &id).await.map_err(reg_err)?;
				}
			}
		}
		Ok(out)
	}

	async fn delete(&self, job_id: &str) -> Result<(), ScribeError> {
		let mut conn = self.conn().await?;
		let _: () = conn.del(Self::job_key(job_id)).await.map_err(reg_err)?;
		let _: () = conn.srem(JOB_INDEX_KEY, job_id).await.map_err(reg_err)?;
		Ok(())
	}

	async fn record_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), ScribeError> {
		let mut conn = self.conn().await?;
		let _: () = conn
			.set_ex(format!("{WORKER_KEY_PREFIX}{worker_id}"), crate::job::now_epoch_secs(), ttl.as_secs().max(1))
			.await
			.map_err(reg_err)?;
		Ok(())
	}

	async fn alive_workers(&self) -> Result<usize, ScribeError> {
		let mut conn = self.conn().await?;
		let keys: Vec<String> = conn.keys(format!("{WORKER_KEY_PREFIX}*")).await.map_err(reg_err)?;
		Ok(keys.len())
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
	use crate::job::SubmitOptions;
	use std::sync::Arc;

	fn record(id: &str) -> JobRecord {
		JobRecord::new(id.to_string(), "fp".into(), "a.wav".into(), SubmitOptions::default())
	}

	#[tokio::test]
	async fn create_is_exclusive_on_id() {
		let reg = MemoryRegistry::new();
		reg.create(&record("j1")).await.unwrap();
		let err = reg.create(&record("j1")).await.unwrap_err();
		assert_eq!(err.kind(), "Conflict");
	}

	#[tokio::test]
	async fn cas_rejects_wrong_expected_state() {
		let reg = MemoryRegistry::new();
		reg.create(&record("j1")).await.unwrap();

		let mut claimed = record("j1");
		claimed.state = JobState::Processing;
		reg.compare_and_swap("j1", JobState::Queued, claimed).await.unwrap();

		// A second claim must observe the Processing state and lose.
		let mut second = record("j1");
		second.state = JobState::Processing;
		let err = reg.compare_and_swap("j1", JobState::Queued, second).await.unwrap_err();
		match err {
			ScribeError::StateMismatch { actual } => assert_eq!(actual, JobState::Processing),
			other => panic!("expected StateMismatch, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn concurrent_claims_have_one_winner() {
		let reg = Arc::new(MemoryRegistry::new());
		reg.create(&record("contended")).await.unwrap();

		let mut handles = Vec::new();
		for _ in 0..8 {
			let reg = Arc::clone(&reg);
			handles.push(tokio::spawn(async move {
				let mut claimed = record("contended");
				claimed.state = JobState::Processing;
				claimed.attempt = 1;
				reg.compare_and_swap("contended", JobState::Queued, claimed).await.is_ok()
			}));
		}

		let mut winners = 0;
		for h in handles {
			if h.await.unwrap() {
				winners += 1;
			}
		}
		assert_eq!(winners, 1, "exactly one claim may succeed");
	}

	#[tokio::test]
	async fn cas_on_unknown_job_is_not_found() {
		let reg = MemoryRegistry::new();
		let err = reg.compare_and_swap("ghost", JobState::Queued, record("ghost")).await.unwrap_err();
		assert_eq!(err.kind(), "NotFound");
	}

	#[tokio::test]
	async fn list_by_state_filters_and_limits() {
		let reg = MemoryRegistry::new();
		for i in 0..5 {
			reg.create(&record(&format!("j{i}"))).await.unwrap();
		}
		let mut done = record("j0");
		done.state = JobState::Processing;
		reg.compare_and_swap("j0", JobState::Queued, done).await.unwrap();

		assert_eq!(reg.list_by_state(JobState::Queued, 10).await.unwrap().len(), 4);
		assert_eq!(reg.list_by_state(JobState::Queued, 2).await.unwrap().len(), 2);
		assert_eq!(reg.list_by_state(JobState::Processing, 10).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn deleted_records_vanish() {
		let reg = MemoryRegistry::new();
		reg.create(&record("gone")).await.unwrap();
		reg.delete("gone").await.unwrap();
		assert_eq!(reg.get("gone").await.unwrap_err().kind(), "NotFound");
	}

	#[tokio::test]
	async fn heartbeats_expire() {
		let reg = MemoryRegistry::new();
		reg.record_heartbeat("w1", Duration::from_millis(10)).await.unwrap();
		reg.record_heartbeat("w2", Duration::from_secs(60)).await.unwrap();
		assert_eq!(reg.alive_workers().await.unwrap(), 2);
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(reg.alive_workers().await.unwrap(), 1);
	}

	// Requires a running Redis at REDIS_TEST_URL; exercised manually.
	#[tokio::test]
	#[ignore]
	async fn redis_cas_round_trip() {
		let url = std::env::var("REDIS_TEST_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
		let reg = RedisRegistry::connect(&url).unwrap();
		let id = uuid::Uuid::new_v4().to_string();
		reg.create(&record(&id)).await.unwrap();

		let mut claimed = record(&id);
		claimed.state = JobState::Processing;
		reg.compare_and_swap(&id, JobState::Queued, claimed.clone()).await.unwrap();
		let err = reg.compare_and_swap(&id, JobState::Queued, claimed).await.unwrap_err();
		assert_eq!(err.kind(), "StateMismatch");
		reg.delete(&id).await.unwrap();
	}
}
