//! Redis-backed durable job queue.
//!
//! At-least-once delivery from producers (admission, scheduler, API) to
//! the worker, with deterministic per-repository deduplication and
//! exponential retry backoff. Key layout under a fixed prefix:
//!
//! ```text
//! {prefix}:ids       set    job ids currently queued/delayed/active (dedup)
//! {prefix}:ready     zset   runnable jobs, scored by enqueue time
//! {prefix}:delayed   zset   retry jobs, scored by their due time
//! {prefix}:active    hash   job id -> claimed job json
//! {prefix}:completed zset   finished jobs, trimmed to the last 1000
//! {prefix}:failed    zset   discarded jobs, trimmed to the last 2000
//! ```
//!
//! A job id stays in `{prefix}:ids` from enqueue until the job completes
//! or is discarded, which is the dedup window: concurrent producers for
//! the same repository collapse onto one queued job.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::events::QueueTransition;
use super::job::{job_id_for_repository, QueuedJob, TagJobPayload};

/// Attempts before a transiently failing job is discarded.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// First retry delay; subsequent delays double.
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_COEFFICIENT: u32 = 2;
/// Completed jobs retained for operator visibility.
const COMPLETED_RETENTION: i64 = 1_000;
/// Failed jobs retained for operator visibility.
const FAILED_RETENTION: i64 = 2_000;

const KEY_PREFIX: &str = "apphub:tagging";

/// Delay before the next delivery of a job whose `attempt`-th delivery
/// failed: 500ms, 1000ms, 2000ms, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_INITIAL * BACKOFF_COEFFICIENT.saturating_pow(exponent)
}

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Job was enqueued, returns the new job id.
    Created(String),
    /// A job for this repository is already present, returns its id.
    Duplicate(String),
}

impl EnqueueResult {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Trait for job queue operations.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a tagging job. Deduplicated on the deterministic job id:
    /// if a job for the same repository is already queued, delayed, or
    /// active this is a no-op returning the existing identity.
    async fn enqueue(&self, payload: TagJobPayload) -> Result<EnqueueResult>;

    /// Claim the next runnable job, if any. Claims are atomic: a given
    /// job is delivered to exactly one caller at a time.
    async fn claim(&self) -> Result<Option<QueuedJob>>;

    /// Mark a claimed job as completed, ending its dedup window.
    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    /// Mark a claimed job as failed. Transient failures re-enter the
    /// queue after backoff while attempts remain; permanent failures are
    /// discarded immediately.
    async fn fail(&self, job: &QueuedJob, reason: &str, transient: bool) -> Result<()>;

    /// Jobs currently queued, delayed, or active.
    async fn depth(&self) -> Result<u64>;

    /// Subscribe to queue transitions.
    fn subscribe(&self) -> broadcast::Receiver<QueueTransition>;
}

/// Create the shared Redis connection pool and verify connectivity.
pub async fn create_redis_pool(url: &str) -> Result<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config::from_url(url);
    let pool = cfg
        .builder()
        .context("invalid Redis configuration")?
        .max_size(16)
        .runtime(deadpool_redis::Runtime::Tokio1)
        .build()
        .context("failed to create Redis pool")?;

    let mut conn = pool.get().await.context("failed to connect to Redis")?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .context("Redis ping failed")?;

    info!("Redis connection pool created");
    Ok(pool)
}

fn key_ids() -> String {
    format!("{KEY_PREFIX}:ids")
}
fn key_ready() -> String {
    format!("{KEY_PREFIX}:ready")
}
fn key_delayed() -> String {
    format!("{KEY_PREFIX}:delayed")
}
fn key_active() -> String {
    format!("{KEY_PREFIX}:active")
}
fn key_completed() -> String {
    format!("{KEY_PREFIX}:completed")
}
fn key_failed() -> String {
    format!("{KEY_PREFIX}:failed")
}

/// Redis-backed queue implementation.
pub struct RedisJobQueue {
    pool: deadpool_redis::Pool,
    transitions: broadcast::Sender<QueueTransition>,
}

impl RedisJobQueue {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self { pool, transitions }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn emit(&self, transition: QueueTransition) {
        // No receivers is fine; transitions are advisory.
        let _ = self.transitions.send(transition);
    }

    /// Move delayed jobs whose due time has passed into the ready set.
    async fn promote_delayed(&self, conn: &mut deadpool_redis::Connection) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn.zrangebyscore(key_delayed(), 0i64, now).await?;

        let mut moved = 0u64;
        for job_json in due {
            let _: () = redis::pipe()
                .zrem(key_delayed(), &job_json)
                .zadd(key_ready(), &job_json, now)
                .query_async(&mut **conn)
                .await?;
            moved += 1;
        }

        if moved > 0 {
            debug!(count = moved, "promoted delayed jobs");
        }
        Ok(moved)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, payload: TagJobPayload) -> Result<EnqueueResult> {
        let job_id = job_id_for_repository(&payload.repository_id);
        let mut conn = self.conn().await?;

        // The dedup window: the id set holds every queued/delayed/active
        // job. SADD is atomic, so concurrent producers race safely.
        let added: i64 = conn.sadd(key_ids(), &job_id).await?;
        if added == 0 {
            debug!(
                job_id = %job_id,
                repository_id = %payload.repository_id,
                "duplicate enqueue suppressed"
            );
            return Ok(EnqueueResult::Duplicate(job_id));
        }

        let job = QueuedJob {
            id: job_id.clone(),
            payload,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: Utc::now(),
            last_error: None,
        };
        let job_json = serde_json::to_string(&job)?;

        let pushed: Result<()> = async {
            let _: () = conn
                .zadd(key_ready(), &job_json, job.enqueued_at.timestamp_millis())
                .await?;
            Ok(())
        }
        .await;

        if let Err(err) = pushed {
            // Roll the dedup marker back so the job can be enqueued again.
            let _: std::result::Result<i64, _> = conn.srem(key_ids(), &job_id).await;
            return Err(err);
        }

        debug!(
            job_id = %job.id,
            repository_id = %job.payload.repository_id,
            trigger = %job.payload.trigger,
            "enqueued job"
        );
        self.emit(QueueTransition::Waiting {
            job_id: job.id.clone(),
            repository_id: job.payload.repository_id.clone(),
            trigger: job.payload.trigger,
        });

        Ok(EnqueueResult::Created(job_id))
    }

    async fn claim(&self) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn().await?;

        self.promote_delayed(&mut conn).await?;

        loop {
            // ZPOPMIN atomically removes the oldest runnable job, so no
            // two workers ever hold the same job.
            let popped: Vec<(String, f64)> = conn.zpopmin(key_ready(), 1).await?;
            let Some((job_json, _score)) = popped.into_iter().next() else {
                return Ok(None);
            };

            let mut job: QueuedJob = match serde_json::from_str(&job_json) {
                Ok(job) => job,
                Err(err) => {
                    error!(error = %err, "dropping undecodable queued job");
                    continue;
                }
            };

            job.attempt += 1;
            let updated = serde_json::to_string(&job)?;
            let _: () = conn.hset(key_active(), &job.id, &updated).await?;

            debug!(
                job_id = %job.id,
                repository_id = %job.payload.repository_id,
                attempt = job.attempt,
                "claimed job"
            );
            self.emit(QueueTransition::Active {
                job_id: job.id.clone(),
                attempt: job.attempt,
            });

            return Ok(Some(job));
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp_millis();
        let job_json = serde_json::to_string(job)?;

        let _: () = redis::pipe()
            .hdel(key_active(), &job.id)
            .srem(key_ids(), &job.id)
            .zadd(key_completed(), &job_json, now)
            .query_async(&mut *conn)
            .await?;

        // Keep only the most recent completions.
        let _: i64 = redis::cmd("ZREMRANGEBYRANK")
            .arg(key_completed())
            .arg(0i64)
            .arg(-(COMPLETED_RETENTION + 1))
            .query_async(&mut *conn)
            .await?;

        debug!(job_id = %job.id, "completed job");
        self.emit(QueueTransition::Completed {
            job_id: job.id.clone(),
        });

        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, reason: &str, transient: bool) -> Result<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();

        let mut failed = job.clone();
        failed.last_error = Some(reason.to_string());

        let will_retry = transient && failed.attempt < failed.max_attempts;

        if will_retry {
            let delay = backoff_delay(failed.attempt);
            let due = now + chrono::Duration::from_std(delay).unwrap_or_default();
            let job_json = serde_json::to_string(&failed)?;

            let _: () = redis::pipe()
                .hdel(key_active(), &failed.id)
                .zadd(key_delayed(), &job_json, due.timestamp_millis())
                .query_async(&mut *conn)
                .await?;

            warn!(
                job_id = %failed.id,
                attempt = failed.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "job failed, retry scheduled"
            );
        } else {
            let job_json = serde_json::to_string(&failed)?;

            let _: () = redis::pipe()
                .hdel(key_active(), &failed.id)
                .srem(key_ids(), &failed.id)
                .zadd(key_failed(), &job_json, now.timestamp_millis())
                .query_async(&mut *conn)
                .await?;

            let _: i64 = redis::cmd("ZREMRANGEBYRANK")
                .arg(key_failed())
                .arg(0i64)
                .arg(-(FAILED_RETENTION + 1))
                .query_async(&mut *conn)
                .await?;

            warn!(
                job_id = %failed.id,
                attempts = failed.attempt,
                transient,
                error = %reason,
                "job discarded"
            );
        }

        self.emit(QueueTransition::Failed {
            job_id: failed.id,
            reason: reason.to_string(),
            will_retry,
        });

        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let (ready, delayed, active): (u64, u64, u64) = redis::pipe()
            .zcard(key_ready())
            .zcard(key_delayed())
            .hlen(key_active())
            .query_async(&mut *conn)
            .await?;
        Ok(ready + delayed + active)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueTransition> {
        self.transitions.subscribe()
    }
}

pub mod testing {
    //! In-memory queue for tests.

    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct QueueState {
        ids: HashSet<String>,
        ready: VecDeque<QueuedJob>,
        enqueued: Vec<TagJobPayload>,
        completed: Vec<String>,
        failed: Vec<(String, String, bool)>,
    }

    /// Queue double that records every call and applies the same dedup
    /// rule as the Redis implementation.
    pub struct RecordingJobQueue {
        state: Mutex<QueueState>,
        transitions: broadcast::Sender<QueueTransition>,
    }

    impl Default for RecordingJobQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RecordingJobQueue {
        pub fn new() -> Self {
            let (transitions, _) = broadcast::channel(64);
            Self {
                state: Mutex::new(QueueState::default()),
                transitions,
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Payloads accepted by `enqueue` (duplicates excluded).
        pub fn enqueued(&self) -> Vec<TagJobPayload> {
            self.lock().enqueued.clone()
        }

        pub fn enqueued_count(&self) -> usize {
            self.lock().enqueued.len()
        }

        pub fn completed_ids(&self) -> Vec<String> {
            self.lock().completed.clone()
        }

        /// `(job_id, reason, will_retry)` per failure.
        pub fn failures(&self) -> Vec<(String, String, bool)> {
            self.lock().failed.clone()
        }
    }

    #[async_trait]
    impl JobQueue for RecordingJobQueue {
        async fn enqueue(&self, payload: TagJobPayload) -> Result<EnqueueResult> {
            let job_id = job_id_for_repository(&payload.repository_id);
            let mut state = self.lock();

            if !state.ids.insert(job_id.clone()) {
                return Ok(EnqueueResult::Duplicate(job_id));
            }

            state.enqueued.push(payload.clone());
            state.ready.push_back(QueuedJob {
                id: job_id.clone(),
                payload,
                attempt: 0,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                enqueued_at: Utc::now(),
                last_error: None,
            });
            Ok(EnqueueResult::Created(job_id))
        }

        async fn claim(&self) -> Result<Option<QueuedJob>> {
            let mut state = self.lock();
            Ok(state.ready.pop_front().map(|mut job| {
                job.attempt += 1;
                job
            }))
        }

        async fn complete(&self, job: &QueuedJob) -> Result<()> {
            let mut state = self.lock();
            state.ids.remove(&job.id);
            state.completed.push(job.id.clone());
            Ok(())
        }

        async fn fail(&self, job: &QueuedJob, reason: &str, transient: bool) -> Result<()> {
            let mut state = self.lock();
            let will_retry = transient && job.attempt < job.max_attempts;
            if will_retry {
                let mut retry = job.clone();
                retry.last_error = Some(reason.to_string());
                state.ready.push_back(retry);
            } else {
                state.ids.remove(&job.id);
            }
            state.failed.push((job.id.clone(), reason.to_string(), will_retry));
            Ok(())
        }

        async fn depth(&self) -> Result<u64> {
            Ok(self.lock().ready.len() as u64)
        }

        fn subscribe(&self) -> broadcast::Receiver<QueueTransition> {
            self.transitions.subscribe()
        }
    }
}
