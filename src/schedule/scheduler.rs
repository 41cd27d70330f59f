//! Cron-driven feed processing
//!
//! One cron job per ready feed plus a daily maintenance job that keeps the
//! extractor binary fresh. Job failures are logged and the scheduler keeps
//! running; overlapping ticks for the same feed are dropped by the shared
//! gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use super::FeedGate;
use crate::config::FeedConfig;
use crate::constants::scheduling::{MAINTENANCE_SCHEDULE, YTDLP_UPDATE_INTERVAL};
use crate::db::{AppStateStore, LAST_YTDLP_UPDATE_KEY};
use crate::pipeline::DataCoordinator;
use crate::ytdlp::YtdlpRunner;

struct TrackedTask {
    handle: JoinHandle<()>,
    /// Set once the task holds a feed slot and is doing real work
    active: Arc<AtomicBool>,
}

/// Drives `process_feed` on each feed's cron schedule.
pub struct FeedScheduler {
    scheduler: JobScheduler,
    coordinator: Arc<DataCoordinator>,
    gate: Arc<FeedGate>,
    tasks: Arc<Mutex<HashMap<u64, TrackedTask>>>,
    next_task_id: Arc<std::sync::atomic::AtomicU64>,
}

impl FeedScheduler {
    pub async fn new(
        coordinator: Arc<DataCoordinator>,
        gate: Arc<FeedGate>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            scheduler: JobScheduler::new().await?,
            coordinator,
            gate,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        })
    }

    /// Register all ready feeds and start ticking.
    pub async fn start(
        &self,
        feeds: Vec<(String, FeedConfig)>,
        ytdlp: Arc<YtdlpRunner>,
        app_state: AppStateStore,
    ) -> anyhow::Result<()> {
        let mut scheduled = 0;
        for (feed_id, config) in feeds {
            let Some(cron) = config.schedule.as_cron() else {
                // manual feeds are driven by the manual runner only
                continue;
            };
            let expression = cron.normalized().to_string();
            let job = self.feed_job(&expression, feed_id.clone(), config.clone())?;
            self.scheduler.add(job).await?;
            scheduled += 1;
        }

        self.scheduler
            .add(self.maintenance_job(ytdlp, app_state)?)
            .await?;
        self.scheduler.start().await?;
        info!(scheduled, "scheduler started");
        Ok(())
    }

    /// Stop accepting ticks.
    ///
    /// With `wait_for_jobs`, in-flight tasks are awaited. Without it,
    /// tasks still waiting for a slot (no work begun, nothing downloading)
    /// are aborted; tasks already holding a slot finish on their own.
    pub async fn stop(&self, wait_for_jobs: bool) {
        let mut scheduler = self.scheduler.clone();
        if let Err(e) = scheduler.shutdown().await {
            warn!(%e, "scheduler shutdown reported an error");
        }

        let mut tasks = self.tasks.lock().await;
        let drained: Vec<TrackedTask> = tasks.drain().map(|(_, task)| task).collect();
        drop(tasks);

        for task in drained {
            if wait_for_jobs {
                if let Err(e) = task.handle.await {
                    if !e.is_cancelled() {
                        error!(%e, "feed task panicked");
                    }
                }
            } else if !task.active.load(Ordering::Acquire) {
                task.handle.abort();
            }
        }
        info!(waited = wait_for_jobs, "scheduler stopped");
    }

    fn feed_job(
        &self,
        expression: &str,
        feed_id: String,
        config: FeedConfig,
    ) -> anyhow::Result<Job> {
        let coordinator = Arc::clone(&self.coordinator);
        let gate = Arc::clone(&self.gate);
        let tasks = Arc::clone(&self.tasks);
        let next_task_id = Arc::clone(&self.next_task_id);

        let job = Job::new_async(expression, move |_job_id, _scheduler| {
            let coordinator = Arc::clone(&coordinator);
            let gate = Arc::clone(&gate);
            let tasks = Arc::clone(&tasks);
            let next_task_id = Arc::clone(&next_task_id);
            let feed_id = feed_id.clone();
            let config = config.clone();

            Box::pin(async move {
                let task_id = next_task_id.fetch_add(1, Ordering::Relaxed);
                let active = Arc::new(AtomicBool::new(false));
                let task_active = Arc::clone(&active);
                let task_tasks = Arc::clone(&tasks);

                let handle = tokio::spawn(async move {
                    let Some(_slot) = gate.acquire(&feed_id).await else {
                        task_tasks.lock().await.remove(&task_id);
                        return;
                    };
                    task_active.store(true, Ordering::Release);

                    let results = coordinator.process_feed(&feed_id, &config).await;
                    if !results.overall_success() {
                        warn!(
                            feed_id = %feed_id,
                            errors = ?collect_errors(&results),
                            "scheduled run finished with failures"
                        );
                    }
                    task_tasks.lock().await.remove(&task_id);
                });

                tasks.lock().await.insert(task_id, TrackedTask { handle, active });
            })
        })?;
        Ok(job)
    }

    /// Daily extractor self-update, throttled through the app-state
    /// timestamp so restarts do not re-trigger it.
    fn maintenance_job(
        &self,
        ytdlp: Arc<YtdlpRunner>,
        app_state: AppStateStore,
    ) -> anyhow::Result<Job> {
        let job = Job::new_async(MAINTENANCE_SCHEDULE, move |_job_id, _scheduler| {
            let ytdlp = Arc::clone(&ytdlp);
            let app_state = app_state.clone();
            Box::pin(async move {
                let last_update = match app_state.get_timestamp(LAST_YTDLP_UPDATE_KEY).await {
                    Ok(value) => value,
                    Err(e) => {
                        error!(%e, "could not read extractor update timestamp");
                        return;
                    }
                };
                let due = last_update.map_or(true, |at| {
                    Utc::now() - at
                        >= chrono::Duration::from_std(YTDLP_UPDATE_INTERVAL)
                            .unwrap_or_else(|_| chrono::Duration::hours(24))
                });
                if !due {
                    return;
                }

                match ytdlp.self_update().await {
                    Ok(()) => {
                        info!("extractor self-update completed");
                        if let Err(e) = app_state
                            .set_timestamp(LAST_YTDLP_UPDATE_KEY, Utc::now())
                            .await
                        {
                            error!(%e, "could not record extractor update timestamp");
                        }
                    }
                    Err(e) => warn!(%e, "extractor self-update failed"),
                }
            })
        })?;
        Ok(job)
    }
}

fn collect_errors(results: &crate::pipeline::ProcessingResults) -> Vec<&String> {
    results
        .enqueue
        .errors
        .iter()
        .chain(&results.download.errors)
        .chain(&results.prune.errors)
        .chain(&results.rss.errors)
        .collect()
}
