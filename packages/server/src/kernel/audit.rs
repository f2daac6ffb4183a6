//! Durable audit store for jobs, runs, and tag assignments.
//!
//! Backed by SQLite at `DATABASE_PATH`. Owns the `jobs`, `job_runs`, and
//! `tag_assignments` tables exclusively and answers the recency queries
//! that gate admission and the scheduler. All mutations run as
//! single-writer transactions; store failures surface to the caller (the
//! run cannot be sealed, the queue retries the job).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    fn job_status(self) -> JobStatus {
        match self {
            RunStatus::Running => JobStatus::Running,
            RunStatus::Succeeded => JobStatus::Succeeded,
            RunStatus::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TagScope {
    Repository,
    File,
}

/// One tracked repository. Exactly one row per repository id.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: i64,
    pub repository_id: String,
    pub status: JobStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One tagging attempt, sealed exactly once.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunRecord {
    pub id: i64,
    pub job_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub prompt: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<i64>,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagAssignmentRecord {
    pub id: i64,
    pub job_run_id: i64,
    pub scope: TagScope,
    pub target: String,
    pub key: String,
    pub value: String,
    pub confidence: Option<f64>,
    pub applied_at: DateTime<Utc>,
}

/// Details recorded when a run is sealed.
#[derive(Debug, Clone, Default)]
pub struct RunDetails {
    pub error_message: Option<String>,
    pub prompt: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub latency_ms: Option<i64>,
    pub raw_response: Option<String>,
}

/// A tag assignment to persist for a successful run.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub scope: TagScope,
    pub target: String,
    pub key: String,
    pub value: String,
    pub confidence: Option<f64>,
}

const RUN_COLUMNS: &str = "id, job_id, status, started_at, completed_at, error_message, prompt, \
     prompt_tokens, completion_tokens, cost_usd, latency_ms, raw_response";

pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    /// Open (creating if needed) the store at `path` and bring the schema
    /// up to date.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open audit store")?;

        Self::migrate(pool).await
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A single connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory audit store")?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run audit store migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Seal runs left `running` by a previous process as failed, so every
    /// run ends in exactly one terminal status even across crashes.
    pub async fn reap_orphaned_runs(&self) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let reaped = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 'failed',
                completed_at = ?1,
                error_message = 'interrupted by restart'
            WHERE status = 'running'
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE jobs SET status = 'failed', updated_at = ?1 WHERE status = 'running'")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if reaped > 0 {
            warn!(count = reaped, "sealed orphaned runs from previous process");
        }
        Ok(reaped)
    }

    /// Insert or touch the job row for a repository.
    pub async fn upsert_job(&self, repository_id: &str) -> Result<JobRecord> {
        let now = Utc::now();
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (repository_id, status, runs, created_at, updated_at)
            VALUES (?1, 'queued', 0, ?2, ?2)
            ON CONFLICT (repository_id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING id, repository_id, status, last_run_at, runs, created_at, updated_at
            "#,
        )
        .bind(repository_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    /// Atomically create a `running` run, bump the job's run counter, and
    /// move the job to `running`.
    pub async fn start_run(&self, job_id: i64) -> Result<JobRunRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, JobRunRecord>(&format!(
            "INSERT INTO job_runs (job_id, status, started_at) VALUES (?1, 'running', ?2) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(job_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                runs = runs + 1,
                last_run_at = ?1,
                updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run)
    }

    /// Seal a run and propagate its terminal status onto the owning job.
    pub async fn complete_run(
        &self,
        run_id: i64,
        status: RunStatus,
        details: RunDetails,
    ) -> Result<JobRunRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let run = sqlx::query_as::<_, JobRunRecord>(&format!(
            r#"
            UPDATE job_runs
            SET status = ?1,
                completed_at = ?2,
                error_message = ?3,
                prompt = ?4,
                prompt_tokens = ?5,
                completion_tokens = ?6,
                latency_ms = ?7,
                raw_response = ?8
            WHERE id = ?9
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(status)
        .bind(now)
        .bind(&details.error_message)
        .bind(&details.prompt)
        .bind(details.prompt_tokens)
        .bind(details.completion_tokens)
        .bind(details.latency_ms)
        .bind(&details.raw_response)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;

        sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.job_status())
            .bind(now)
            .bind(run.job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(run)
    }

    /// Batch-insert assignments for a run in one transaction. No-op when
    /// the batch is empty.
    pub async fn record_assignments(
        &self,
        run_id: i64,
        assignments: &[NewAssignment],
    ) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for assignment in assignments {
            sqlx::query(
                r#"
                INSERT INTO tag_assignments (job_run_id, scope, target, key, value, confidence, applied_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(run_id)
            .bind(assignment.scope)
            .bind(&assignment.target)
            .bind(&assignment.key)
            .bind(&assignment.value)
            .bind(assignment.confidence)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn latest_successful_run(
        &self,
        repository_id: &str,
    ) -> Result<Option<JobRunRecord>> {
        let run = sqlx::query_as::<_, JobRunRecord>(
            r#"
            SELECT r.id, r.job_id, r.status, r.started_at, r.completed_at, r.error_message,
                   r.prompt, r.prompt_tokens, r.completion_tokens, r.cost_usd, r.latency_ms,
                   r.raw_response
            FROM job_runs r
            JOIN jobs j ON j.id = r.job_id
            WHERE j.repository_id = ?1
              AND r.status = 'succeeded'
              AND r.completed_at IS NOT NULL
            ORDER BY r.completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    /// True iff a successful run completed within the past `max_age`.
    /// A run completed in the future (clock skew) does not count.
    pub async fn has_recent_successful_run(
        &self,
        repository_id: &str,
        max_age: Duration,
    ) -> Result<bool> {
        let completions = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT r.completed_at
            FROM job_runs r
            JOIN jobs j ON j.id = r.job_id
            WHERE j.repository_id = ?1
              AND r.status = 'succeeded'
              AND r.completed_at IS NOT NULL
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        Ok(completions
            .into_iter()
            .any(|completed_at| is_recent(completed_at, now, max_age)))
    }

    pub async fn list_recent_jobs(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, repository_id, status, last_run_at, runs, created_at, updated_at
            FROM jobs
            ORDER BY updated_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    pub async fn count_jobs(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_job_by_id(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, repository_id, status, last_run_at, runs, created_at, updated_at
            FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn get_run_by_id(&self, run_id: i64) -> Result<Option<JobRunRecord>> {
        let run = sqlx::query_as::<_, JobRunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    pub async fn list_runs_for_job(&self, job_id: i64) -> Result<Vec<JobRunRecord>> {
        let runs = sqlx::query_as::<_, JobRunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ?1 ORDER BY id DESC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    pub async fn get_assignments_for_run(
        &self,
        run_id: i64,
    ) -> Result<Vec<TagAssignmentRecord>> {
        let assignments = sqlx::query_as::<_, TagAssignmentRecord>(
            r#"
            SELECT id, job_run_id, scope, target, key, value, confidence, applied_at
            FROM tag_assignments
            WHERE job_run_id = ?1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(assignments)
    }

    /// Database liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore").finish_non_exhaustive()
    }
}

/// Recency predicate: `0 <= now - completed_at <= max_age`.
fn is_recent(completed_at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    match (now - completed_at).to_std() {
        Ok(age) => age <= max_age,
        // completed_at is in the future
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn recency_boundaries() {
        let window = Duration::from_secs(3600);
        let now = at(10_000);

        // exactly at the window boundary
        assert!(is_recent(at(10_000 - 3600), now, window));
        // just inside
        assert!(is_recent(at(10_000 - 3599), now, window));
        // just over
        assert!(!is_recent(at(10_000 - 3601), now, window));
        // completed "in the future"
        assert!(!is_recent(at(10_001), now, window));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_repository() {
        let store = AuditStore::in_memory().await.unwrap();

        let first = store.upsert_job("repo-1").await.unwrap();
        let second = store.upsert_job("repo-1").await.unwrap();
        let other = store.upsert_job("repo-2").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(store.count_jobs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn start_run_bumps_counters_and_status() {
        let store = AuditStore::in_memory().await.unwrap();
        let job = store.upsert_job("repo-1").await.unwrap();

        let run = store.start_run(job.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.job_id, job.id);

        let job = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.runs, 1);
        assert_eq!(job.last_run_at, Some(run.started_at));

        store.start_run(job.id).await.unwrap();
        let job = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.runs, 2);
    }

    #[tokio::test]
    async fn complete_run_seals_run_and_job() {
        let store = AuditStore::in_memory().await.unwrap();
        let job = store.upsert_job("repo-1").await.unwrap();
        let run = store.start_run(job.id).await.unwrap();

        let sealed = store
            .complete_run(
                run.id,
                RunStatus::Succeeded,
                RunDetails {
                    prompt: Some("prompt text".to_string()),
                    prompt_tokens: Some(120),
                    completion_tokens: Some(40),
                    latency_ms: Some(950),
                    raw_response: Some(r#"{"repository_tags":[]}"#.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(sealed.status, RunStatus::Succeeded);
        assert!(sealed.completed_at.is_some());
        assert_eq!(sealed.prompt_tokens, Some(120));

        let job = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_run_keeps_error_details() {
        let store = AuditStore::in_memory().await.unwrap();
        let job = store.upsert_job("repo-1").await.unwrap();
        let run = store.start_run(job.id).await.unwrap();

        let sealed = store
            .complete_run(
                run.id,
                RunStatus::Failed,
                RunDetails {
                    error_message: Some("repository metadata missing repoUrl".to_string()),
                    latency_ms: Some(12),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(sealed.status, RunStatus::Failed);
        assert!(sealed
            .error_message
            .as_deref()
            .unwrap()
            .contains("repoUrl"));

        let job = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn recency_sees_only_successful_runs() {
        let store = AuditStore::in_memory().await.unwrap();
        let window = Duration::from_secs(3600);
        let job = store.upsert_job("repo-1").await.unwrap();

        assert!(!store
            .has_recent_successful_run("repo-1", window)
            .await
            .unwrap());

        let run = store.start_run(job.id).await.unwrap();
        store
            .complete_run(run.id, RunStatus::Failed, RunDetails::default())
            .await
            .unwrap();
        assert!(!store
            .has_recent_successful_run("repo-1", window)
            .await
            .unwrap());

        let run = store.start_run(job.id).await.unwrap();
        store
            .complete_run(run.id, RunStatus::Succeeded, RunDetails::default())
            .await
            .unwrap();
        assert!(store
            .has_recent_successful_run("repo-1", window)
            .await
            .unwrap());
        assert!(!store
            .has_recent_successful_run("other", window)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn latest_successful_run_is_returned() {
        let store = AuditStore::in_memory().await.unwrap();
        let job = store.upsert_job("repo-1").await.unwrap();

        assert!(store
            .latest_successful_run("repo-1")
            .await
            .unwrap()
            .is_none());

        let first = store.start_run(job.id).await.unwrap();
        store
            .complete_run(first.id, RunStatus::Succeeded, RunDetails::default())
            .await
            .unwrap();
        let second = store.start_run(job.id).await.unwrap();
        store
            .complete_run(second.id, RunStatus::Succeeded, RunDetails::default())
            .await
            .unwrap();

        let latest = store.latest_successful_run("repo-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn assignments_round_trip() {
        let store = AuditStore::in_memory().await.unwrap();
        let job = store.upsert_job("repo-1").await.unwrap();
        let run = store.start_run(job.id).await.unwrap();

        store.record_assignments(run.id, &[]).await.unwrap();
        assert!(store
            .get_assignments_for_run(run.id)
            .await
            .unwrap()
            .is_empty());

        store
            .record_assignments(
                run.id,
                &[
                    NewAssignment {
                        scope: TagScope::Repository,
                        target: "repo-1".to_string(),
                        key: "language".to_string(),
                        value: "rust".to_string(),
                        confidence: Some(0.9),
                    },
                    NewAssignment {
                        scope: TagScope::File,
                        target: "src/main.rs".to_string(),
                        key: "role".to_string(),
                        value: "entrypoint".to_string(),
                        confidence: None,
                    },
                ],
            )
            .await
            .unwrap();

        let assignments = store.get_assignments_for_run(run.id).await.unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].scope, TagScope::Repository);
        assert_eq!(assignments[0].confidence, Some(0.9));
        assert_eq!(assignments[1].scope, TagScope::File);
        assert_eq!(assignments[1].target, "src/main.rs");
    }

    #[tokio::test]
    async fn orphaned_runs_are_sealed_at_startup() {
        let store = AuditStore::in_memory().await.unwrap();
        let job = store.upsert_job("repo-1").await.unwrap();
        let run = store.start_run(job.id).await.unwrap();

        let reaped = store.reap_orphaned_runs().await.unwrap();
        assert_eq!(reaped, 1);

        let run = store.get_run_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.error_message.as_deref(), Some("interrupted by restart"));

        let job = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }
}
