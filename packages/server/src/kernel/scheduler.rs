//! Periodic backstop for lost events.
//!
//! Once at startup and then on every interval tick, the scheduler pages
//! through the catalog and enqueues any ready repository without a
//! successful run in the past 24 hours. A sweep still in progress when
//! the timer fires is skipped rather than overlapped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::audit::AuditStore;
use super::catalog_client::BaseCatalog;
use super::jobs::{JobQueue, JobTrigger, TagJobPayload};

/// A successful run within this window suppresses scheduled enqueues.
pub const SCHEDULER_RECENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Catalog listing page size.
const PAGE_SIZE: i64 = 50;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

pub struct TagScheduler {
    catalog: Arc<dyn BaseCatalog>,
    queue: Arc<dyn JobQueue>,
    store: Arc<AuditStore>,
    config: SchedulerConfig,
    sweeping: AtomicBool,
}

impl TagScheduler {
    pub fn new(
        catalog: Arc<dyn BaseCatalog>,
        queue: Arc<dyn JobQueue>,
        store: Arc<AuditStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            catalog,
            queue,
            store,
            config,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Run until shutdown: one sweep immediately, then one per interval.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "scheduler starting"
        );

        self.sweep_guarded().await;

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep_guarded().await,
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// One sweep, skipped if the previous one is still in progress.
    pub async fn sweep_guarded(&self) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            warn!("previous sweep still in progress, skipping tick");
            return;
        }

        match self.sweep().await {
            Ok(enqueued) => {
                info!(enqueued, "scheduler sweep finished");
            }
            Err(err) => {
                error!(error = %err, "scheduler sweep failed");
            }
        }

        self.sweeping.store(false, Ordering::SeqCst);
    }

    async fn sweep(&self) -> Result<u64> {
        let mut page = 1i64;
        let mut enqueued = 0u64;

        loop {
            let summaries = self.catalog.list_repositories(page, PAGE_SIZE).await?;
            let page_len = summaries.len();

            for summary in summaries {
                let Some(repository_id) = summary.id.as_deref() else {
                    continue;
                };
                if let Some(status) = summary.ingest_status.as_deref() {
                    if status != "ready" {
                        continue;
                    }
                }
                if self
                    .store
                    .has_recent_successful_run(repository_id, SCHEDULER_RECENCY_WINDOW)
                    .await?
                {
                    continue;
                }

                let payload = TagJobPayload::new(repository_id, JobTrigger::Scheduler)
                    .with_reason("scheduled sweep");
                let result = self.queue.enqueue(payload).await?;
                if result.is_created() {
                    enqueued += 1;
                    debug!(repository_id = %repository_id, "scheduled tagging job");
                }
            }

            if (page_len as i64) < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        Ok(enqueued)
    }
}
