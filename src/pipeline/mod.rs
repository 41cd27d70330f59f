//! The per-feed processing pipeline
//!
//! Four phases run strictly in order: enqueue, download, prune, rss. A
//! phase failure is recorded but never prevents the later phases from
//! running; a feed whose upstream fetch broke still delivers its queued
//! items and regenerates its document from what it already has.

pub mod downloader;
pub mod enqueuer;
pub mod pruner;

pub use downloader::{DownloadPhaseResult, Downloader};
pub use enqueuer::{EnqueueResult, Enqueuer, RefreshOutcome};
pub use pruner::{PruneResult, Pruner};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::FeedConfig;
use crate::cron::calculate_fetch_until_date;
use crate::db::types::{Feed, SourceType};
use crate::db::FeedStore;
use crate::image::ImageDownloader;
use crate::rss::RssFeedGenerator;

/// Outcome of a single phase.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub success: bool,
    /// Phase-specific count: items queued, downloaded, archived, or feed
    /// items rendered
    pub count: usize,
    pub duration: Duration,
    pub errors: Vec<String>,
}

impl PhaseResult {
    fn succeeded(count: usize, duration: Duration) -> Self {
        Self {
            success: true,
            count,
            duration,
            errors: Vec::new(),
        }
    }

    fn failed(duration: Duration, error: String) -> Self {
        Self {
            success: false,
            count: 0,
            duration,
            errors: vec![error],
        }
    }

    fn skipped() -> Self {
        Self {
            success: true,
            count: 0,
            duration: Duration::ZERO,
            errors: Vec::new(),
        }
    }
}

/// Everything one `process_feed` run produced.
#[derive(Debug, Clone)]
pub struct ProcessingResults {
    pub feed_id: String,
    pub started_at: DateTime<Utc>,
    pub enqueue: PhaseResult,
    pub download: PhaseResult,
    pub prune: PhaseResult,
    pub rss: PhaseResult,
    pub total_duration: Duration,
}

impl ProcessingResults {
    pub fn overall_success(&self) -> bool {
        self.enqueue.success && self.download.success && self.prune.success && self.rss.success
    }
}

/// Drives the four phases for one feed at a time.
pub struct DataCoordinator {
    feeds: FeedStore,
    enqueuer: Arc<Enqueuer>,
    downloader: Arc<Downloader>,
    pruner: Arc<Pruner>,
    rss: Arc<RssFeedGenerator>,
    images: Arc<ImageDownloader>,
    cookies_path: Option<PathBuf>,
}

impl DataCoordinator {
    pub fn new(
        feeds: FeedStore,
        enqueuer: Arc<Enqueuer>,
        downloader: Arc<Downloader>,
        pruner: Arc<Pruner>,
        rss: Arc<RssFeedGenerator>,
        images: Arc<ImageDownloader>,
        cookies_path: Option<PathBuf>,
    ) -> Self {
        Self {
            feeds,
            enqueuer,
            downloader,
            pruner,
            rss,
            images,
            cookies_path,
        }
    }

    /// Run enqueue → download → prune → rss for one feed.
    pub async fn process_feed(
        &self,
        feed_id: &str,
        feed_config: &FeedConfig,
    ) -> ProcessingResults {
        let started_at = Utc::now();
        let run_timer = Instant::now();
        let cookies = self.cookies_path.as_deref();
        info!(feed_id, "feed processing started");

        // the fetch window opens at the last recorded watermark
        let fetch_since = match self.feeds.get_feed_by_id(feed_id).await {
            Ok(feed) => feed.last_successful_sync,
            Err(e) => {
                error!(feed_id, %e, "feed missing at pipeline start");
                let failed = PhaseResult::failed(run_timer.elapsed(), e.to_string());
                return ProcessingResults {
                    feed_id: feed_id.to_string(),
                    started_at,
                    enqueue: failed.clone(),
                    download: PhaseResult::skipped(),
                    prune: PhaseResult::skipped(),
                    rss: PhaseResult::skipped(),
                    total_duration: run_timer.elapsed(),
                };
            }
        };
        let fetch_until = feed_config
            .schedule
            .as_cron()
            .map(|cron| calculate_fetch_until_date(cron, fetch_since));

        // phase 1: enqueue
        let timer = Instant::now();
        let (enqueue, sync_candidate) = match self
            .enqueuer
            .enqueue_new_downloads(feed_id, feed_config, fetch_since, fetch_until, cookies)
            .await
        {
            Ok(result) => (
                PhaseResult::succeeded(result.queued_count, timer.elapsed()),
                Some(result.sync_candidate),
            ),
            Err(e) => {
                warn!(feed_id, %e, "enqueue phase failed");
                (PhaseResult::failed(timer.elapsed(), e.to_string()), None)
            }
        };

        // phase 2: download
        let timer = Instant::now();
        let download = match self
            .downloader
            .download_queued(feed_id, feed_config, cookies, -1)
            .await
        {
            Ok(result) => {
                let mut phase =
                    PhaseResult::succeeded(result.success_count, timer.elapsed());
                if result.failure_count > 0 {
                    phase.success = false;
                    phase.errors.push(format!(
                        "{} download(s) failed",
                        result.failure_count
                    ));
                }
                phase
            }
            Err(e) => {
                warn!(feed_id, %e, "download phase failed");
                PhaseResult::failed(timer.elapsed(), e.to_string())
            }
        };

        // phase 3: prune
        let timer = Instant::now();
        let prune = match self
            .pruner
            .prune_feed_downloads(feed_id, feed_config.keep_last, feed_config.since)
            .await
        {
            Ok(result) => PhaseResult::succeeded(result.archived_count, timer.elapsed()),
            Err(e) => {
                warn!(feed_id, %e, "prune phase failed");
                PhaseResult::failed(timer.elapsed(), e.to_string())
            }
        };

        // phase 4: rss (preceded by a best-effort cover-art fetch so the
        // document can point at locally hosted artwork)
        let timer = Instant::now();
        let rss = match self.feeds.get_feed_by_id(feed_id).await {
            Ok(feed) => {
                let feed = self.ensure_cover_art(feed, feed_config).await;
                match self.rss.update_feed(feed_id, &feed).await {
                    Ok(()) => {
                        PhaseResult::succeeded(feed.total_downloads as usize, timer.elapsed())
                    }
                    Err(e) => {
                        warn!(feed_id, %e, "rss phase failed");
                        PhaseResult::failed(timer.elapsed(), e.to_string())
                    }
                }
            }
            Err(e) => PhaseResult::failed(timer.elapsed(), e.to_string()),
        };

        // bookkeeping: a successful enumeration advances the watermark even
        // when delivery had failures; the next window must not re-scan what
        // was already seen
        if enqueue.success {
            if let Err(e) = self.feeds.mark_sync_success(feed_id, sync_candidate).await {
                error!(feed_id, %e, "failed to record sync success");
            }
        } else if let Err(e) = self.feeds.mark_sync_failure(feed_id).await {
            error!(feed_id, %e, "failed to record sync failure");
        }
        if rss.success {
            if let Err(e) = self.feeds.mark_rss_generated(feed_id).await {
                error!(feed_id, %e, "failed to record rss generation");
            }
        }

        let results = ProcessingResults {
            feed_id: feed_id.to_string(),
            started_at,
            enqueue,
            download,
            prune,
            rss,
            total_duration: run_timer.elapsed(),
        };
        self.log_finished(&results);
        results
    }

    /// Fetch and convert the feed's cover art once; until it succeeds the
    /// document falls back to the remote image URL.
    async fn ensure_cover_art(&self, feed: Feed, feed_config: &FeedConfig) -> Feed {
        if feed.image_ext.is_some() {
            return feed;
        }

        let source_thumbnail = (feed.source_type != SourceType::Manual)
            .then(|| feed.resolved_url.as_deref().or(feed.source_url.as_deref()))
            .flatten();
        let attempt = if let Some(remote_url) = feed.remote_image_url.as_deref() {
            self.images.download_feed_image(&feed.id, remote_url).await
        } else if let Some(source_url) = source_thumbnail {
            self.images
                .download_feed_image_from_source(
                    &feed.id,
                    source_url,
                    &feed_config.yt_args_vec(),
                    self.cookies_path.as_deref(),
                )
                .await
        } else {
            return feed;
        };

        match attempt {
            Ok(ext) => {
                if let Err(e) = self.feeds.set_feed_image_ext(&feed.id, Some(&ext)).await {
                    error!(feed_id = %feed.id, %e, "failed to record cover art");
                    return feed;
                }
                Feed {
                    image_ext: Some(ext),
                    ..feed
                }
            }
            Err(e) => {
                warn!(feed_id = %feed.id, %e, "cover art fetch failed");
                feed
            }
        }
    }

    fn log_finished(&self, results: &ProcessingResults) {
        info!(
            feed_id = %results.feed_id,
            overall_success = results.overall_success(),
            queued = results.enqueue.count,
            downloaded = results.download.count,
            archived = results.prune.count,
            duration_ms = results.total_duration.as_millis() as u64,
            "feed processing finished"
        );
    }
}
