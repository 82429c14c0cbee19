pub mod blob;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod janitor;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod worker;

pub use blob::BlobStore;
pub use cache::{MemoryCache, RedisCache, ResultCache};
pub use config::Config;
pub use engine::{CommandEngine, EngineConfig, EngineError, MockEngine, TranscriptionEngine};
pub use error::ScribeError;
pub use fingerprint::Fingerprinter;
pub use janitor::Janitor;
pub use job::{JobRecord, JobState, SubmitOptions, Transcript, TranscriptSegment};
pub use queue::{MemoryQueue, RedisQueue, WorkQueue};
pub use rate_limit::{BucketClass, RateLimiter};
pub use registry::{JobRegistry, MemoryRegistry, RedisRegistry};
pub use worker::Worker;
