use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::error::ScribeError;

/// Which admission class a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketClass {
	Submit,
	Poll,
}

/// Lock-free token bucket: tokens are refilled from elapsed wall time and
/// consumed with a compare-exchange loop.
struct TokenBucket {
	max_tokens: u32,
	refill_per_min: u32,
	tokens: AtomicU32,
	last_refill: AtomicU64, // timestamp in milliseconds
}

impl TokenBucket {
	fn new(max_tokens: u32, refill_per_min: u32) -> Self {
		Self {
			max_tokens,
			refill_per_min,
			tokens: AtomicU32::new(max_tokens), // start with full bucket
			last_refill: AtomicU64::new(current_time_millis()),
		}
	}

	fn try_acquire(&self) -> Result<(), u64> {
		let now = current_time_millis();
		let last_refill = self.last_refill.load(Ordering::Relaxed);

		let elapsed = now.saturating_sub(last_refill);
		let tokens_to_add = (elapsed * self.refill_per_min as u64) / 60_000;

		if tokens_to_add > 0 {
			// One thread wins the race to advance the refill clock and credits
			// the accumulated tokens.
			if self.last_refill.compare_exchange_weak(last_refill, now, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
				let current = self.tokens.load(Ordering::Relaxed);
				let refilled = current.saturating_add(tokens_to_add as u32).min(self.max_tokens);
				self.tokens.store(refilled, Ordering::Relaxed);
			}
		}

		loop {
			let current = self.tokens.load(Ordering::Relaxed);
			if current == 0 {
				return Err(self.retry_after_secs(now));
			}
			if self.tokens.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
				return Ok(());
			}
		}
	}

	/// Seconds until the bucket mints its next token, rounded up and never
	/// below one so clients always back off a little.
	fn retry_after_secs(&self, now_ms: u64) -> u64 {
		let ms_per_token = 60_000 / self.refill_per_min.max(1) as u64;
		let since_refill = now_ms.saturating_sub(self.last_refill.load(Ordering::Relaxed));
		let wait_ms = ms_per_token.saturating_sub(since_refill);
		wait_ms.div_ceil(1000).max(1)
	}
}

fn current_time_millis() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Per-caller admission control: each caller identity gets an independent
/// bucket per class. Caller identity is whatever the transport hands us,
/// typically the source address.
pub struct RateLimiter {
	submit_capacity: u32,
	submit_per_min: u32,
	poll_capacity: u32,
	poll_per_min: u32,
	buckets: DashMap<(BucketClass, String), TokenBucket>,
}

impl RateLimiter {
	pub const DEFAULT_SUBMIT_CAPACITY: u32 = 10;
	pub const DEFAULT_POLL_CAPACITY: u32 = 60;

	pub fn new(submit_per_min: u32, poll_per_min: u32) -> Self {
		Self {
			submit_capacity: Self::DEFAULT_SUBMIT_CAPACITY,
			submit_per_min,
			poll_capacity: Self::DEFAULT_POLL_CAPACITY,
			poll_per_min,
			buckets: DashMap::new(),
		}
	}

	pub fn try_acquire(&self, class: BucketClass, caller: &str) -> Result<(), ScribeError> {
		let (capacity, per_min) = match class {
			BucketClass::Submit => (self.submit_capacity, self.submit_per_min),
			BucketClass::Poll => (self.poll_capacity, self.poll_per_min),
		};
		let bucket = self.buckets.entry((class, caller.to_string())).or_insert_with(|| TokenBucket::new(capacity, per_min));
		bucket.try_acquire().map_err(|retry_after| ScribeError::RateLimited { retry_after })
	}
}
