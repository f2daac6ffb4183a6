//! Job infrastructure for background tagging runs.
//!
//! This module provides the queue-level infrastructure:
//! - [`RedisJobQueue`] - Redis-backed durable job queue with deduplication
//! - [`TagWorker`] - Long-running service that claims and executes jobs
//! - [`QueueTransition`] - Subscribable queue lifecycle events
//!
//! # Architecture
//!
//! ```text
//! Admission / Scheduler / API
//!     │
//!     └─► JobQueue.enqueue(payload)
//!             └─► dedup on job id, push to ready/delayed
//!
//! TagWorker
//!     │
//!     ├─► Claim jobs (atomic pop, bounded concurrency)
//!     ├─► TagJobProcessor.process(payload)
//!     └─► complete / fail (transient → backoff retry, permanent → discard)
//! ```

pub mod events;
mod job;
mod queue;
mod worker;

pub use events::QueueTransition;
pub use job::{job_id_for_repository, JobTrigger, QueuedJob, TagJobPayload};
pub use queue::testing;
pub use queue::{
    backoff_delay, create_redis_pool, EnqueueResult, JobQueue, RedisJobQueue,
    DEFAULT_MAX_ATTEMPTS,
};
pub use worker::{JobProcessor, TagWorker, WorkerConfig};
