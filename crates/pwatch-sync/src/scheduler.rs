use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use pwatch_storage::StoreResult;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::SyncPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduledTask {
    ScrapeDue,
    Digest,
    Cleanup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueScrapeSummary {
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
    pub reports_created: usize,
}

impl SyncPipeline {
    /// Scrapes and diffs every active category whose last run started at
    /// least `scrape_interval_hours` ago. Categories run one after another; a
    /// failing category does not stop the rest.
    pub async fn scrape_due_categories(&self) -> StoreResult<DueScrapeSummary> {
        let now = self.clock.now();
        let mut summary = DueScrapeSummary::default();

        for category in self.store.list_active_categories().await? {
            let last = self.store.last_run_started_at(category.id).await?;
            let interval = Duration::hours(i64::from(category.scrape_interval_hours));
            if last.is_some_and(|at| now - at < interval) {
                continue;
            }
            summary.due += 1;

            let scraped = match self.scrape_category(&category.id.to_string()).await {
                Ok(scraped) => scraped,
                Err(err) => {
                    warn!(category = %category.slug, error = %err, "scheduled scrape failed");
                    summary.failed += 1;
                    continue;
                }
            };
            summary.completed += 1;

            match self.run_diff(scraped.scrape_run_id).await {
                Ok(diff) if diff.change_report_id.is_some() => summary.reports_created += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(category = %category.slug, error = %err, "scheduled diff failed");
                }
            }
        }

        info!(
            due = summary.due,
            completed = summary.completed,
            failed = summary.failed,
            reports = summary.reports_created,
            "due categories processed"
        );
        Ok(summary)
    }

    async fn run_scheduled(&self, task: ScheduledTask) {
        let outcome: Result<()> = match task {
            ScheduledTask::ScrapeDue => self
                .scrape_due_categories()
                .await
                .map(|_| ())
                .map_err(Into::into),
            ScheduledTask::Digest => self.send_digests().await.map(|_| ()).map_err(Into::into),
            ScheduledTask::Cleanup => self
                .cleanup_stale_runs(self.config.stale_run_minutes)
                .await
                .map(|_| ())
                .map_err(Into::into),
        };
        if let Err(err) = outcome {
            error!(?task, error = %err, "scheduled task failed");
        }
    }
}

/// Runs `work` unless an earlier tick still holds `running`. Returns
/// whether it ran.
async fn run_exclusive<F>(running: &Mutex<()>, work: F) -> bool
where
    F: Future<Output = ()>,
{
    let Ok(_held) = running.try_lock() else {
        return false;
    };
    work.await;
    true
}

fn job(pipeline: &Arc<SyncPipeline>, cron: &str, task: ScheduledTask) -> Result<Job> {
    let pipeline = Arc::clone(pipeline);
    let running = Arc::new(Mutex::new(()));
    Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            if !run_exclusive(&running, pipeline.run_scheduled(task)).await {
                warn!(?task, "previous run still in progress; tick skipped");
            }
        })
    })
    .with_context(|| format!("creating {task:?} job for cron {cron}"))
}

/// Cron jobs for due scrapes, digests and the stale-run sweep, or `None`
/// when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    let config = pipeline.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (cron, task) in [
        (&config.scrape_cron, ScheduledTask::ScrapeDue),
        (&config.digest_cron, ScheduledTask::Digest),
        (&config.cleanup_cron, ScheduledTask::Cleanup),
    ] {
        sched
            .add(job(&pipeline, cron, task)?)
            .await
            .context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let running = Mutex::new(());
        let calls = AtomicUsize::new(0);
        let work = || async {
            calls.fetch_add(1, Ordering::SeqCst);
        };

        let held = running.lock().await;
        assert!(!run_exclusive(&running, work()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(run_exclusive(&running, work()).await);
        assert!(run_exclusive(&running, work()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
