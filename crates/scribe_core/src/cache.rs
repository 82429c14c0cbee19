use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::ScribeError;
use crate::job::Transcript;

const CACHE_KEY_PREFIX: &str = "scribe:transcript:";

/// Content-addressed cache of completed transcripts, keyed by fingerprint.
///
/// Entries are immutable and expire at a fixed TTL; reads do not renew it,
/// so `lookup` is side-effect-free. A miss only means the cached copy is
/// gone, never that the work was not done.
#[async_trait]
pub trait ResultCache: Send + Sync {
	async fn lookup(&self, fingerprint: &str) -> Result<Option<Transcript>, ScribeError>;

	async fn put(&self, fingerprint: &str, transcript: &Transcript, ttl: Duration) -> Result<(), ScribeError>;
}

// ---------------------------------------------------------------------------
// In-process backing
// ---------------------------------------------------------------------------

/// Single-process cache used by tests and memory-backed deployments.
#[derive(Default)]
pub struct MemoryCache {
	entries: Mutex<HashMap<String, (Transcript, Instant)>>,
}

impl MemoryCache {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ResultCache for MemoryCache {
	async fn lookup(&self, fingerprint: &str) -> Result<Option<Transcript>, ScribeError> {
		let now = Instant::now();
		let mut entries = self.entries.lock().expect("cache lock");
		match entries.get(fingerprint) {
			Some((_, expires)) if *expires <= now => {
				entries.remove(fingerprint);
				Ok(None)
			}
			Some((transcript, _)) => Ok(Some(transcript.clone())),
			None => Ok(None),
		}
	}

	async fn put(&self, fingerprint: &str, transcript: &Transcript, ttl: Duration) -> Result<(), ScribeError> {
		let expires = Instant::now() + ttl;
		self.entries.lock().expect("cache lock").insert(fingerprint.to_string(), (transcript.clone(), expires));
		Ok(())
	}
}

// ---------------------------------------------------------------------------
// Redis backing
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedisCache {
	client: redis::Client,
}

impl RedisCache {
	pub fn connect(url: &str) -> Result<Self, ScribeError> {
		let client = redis::Client::open(url).map_err(cache_err)?;
		Ok(Self { client })
	}

	fn key(fingerprint: &str) -> String {
		format!("{CACHE_KEY_PREFIX}{fingerprint}")
	}
}

fn cache_err(e: redis::RedisError) -> ScribeError {
	ScribeError::Internal(format!("result cache unavailable: {e}"))
}

#[async_trait]
impl ResultCache for RedisCache {
	async fn lookup(&self, fingerprint: &str) -> Result<Option<Transcript>, ScribeError> {
		let mut conn = self.client.get_multiplexed_async_connection().await.map_err(cache_err)?;
		let raw: Option<String> = conn.get(Self::key(fingerprint)).await.map_err(cache_err)?;
		match raw {
			Some(s) => Ok(Some(serde_json::from_str(&s)?)),
			None => Ok(None),
		}
	}

	async fn put(&self, fingerprint: &str, transcript: &Transcript, ttl: Duration) -> Result<(), ScribeError> {
		let mut conn = self.client.get_multiplexed_async_connection().await.map_err(cache_err)?;
		let serialized = serde_json::to_string(transcript)?;
		let _: () = conn.set_ex(Self::key(fingerprint), serialized, ttl.as_secs().max(1)).await.map_err(cache_err)?;
		debug!(fingerprint, ttl_secs = ttl.as_secs(), "transcript cached");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::TranscriptSegment;

	fn transcript(text: &str) -> Transcript {
		Transcript {
			language: "en".into(),
			language_probability: 0.98,
			duration: 4.2,
			processing_time: 0.5,
			text: text.into(),
			segments: vec![TranscriptSegment {
				start: 0.0,
				end: 4.2,
				text: text.into(),
				confidence: Some(-0.2),
			}],
		}
	}

	#[tokio::test]
	async fn lookup_returns_what_was_put() {
		let cache = MemoryCache::new();
		cache.put("fp1", &transcript("hello"), Duration::from_secs(60)).await.unwrap();
		let got = cache.lookup("fp1").await.unwrap().unwrap();
		assert_eq!(got.text, "hello");
		// Side-effect-free: a second read is identical.
		assert_eq!(cache.lookup("fp1").await.unwrap().unwrap(), got);
	}

	#[tokio::test]
	async fn miss_on_unknown_fingerprint() {
		let cache = MemoryCache::new();
		assert!(cache.lookup("nope").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn entries_expire_at_ttl() {
		let cache = MemoryCache::new();
		cache.put("fp", &transcript("short-lived"), Duration::from_millis(15)).await.unwrap();
		assert!(cache.lookup("fp").await.unwrap().is_some());
		tokio::time::sleep(Duration::from_millis(40)).await;
		assert!(cache.lookup("fp").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn put_overwrites_with_fresh_ttl() {
		let cache = MemoryCache::new();
		cache.put("fp", &transcript("v1"), Duration::from_millis(10)).await.unwrap();
		cache.put("fp", &transcript("v1"), Duration::from_secs(60)).await.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(cache.lookup("fp").await.unwrap().is_some());
	}
}
