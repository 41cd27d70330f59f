//! Startup state reconciliation
//!
//! Bridges the YAML feed map and persisted state. Runs before the
//! scheduler starts: new config entries become feed rows, removed entries
//! are archived, and retention-policy relaxations restore previously
//! archived items. One misbehaving feed never blocks the others; it is
//! simply left off the ready list.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::{FeedConfig, FeedMetadataOverrides};
use crate::constants;
use crate::db::types::{DownloadStatus, Feed, PodcastType, SourceType};
use crate::db::{DownloadStore, FeedMetadataUpdate, FeedStore};
use crate::error::ReconcileError;
use crate::pipeline::Pruner;
use crate::ytdlp::YtdlpRunner;

pub struct StateReconciler {
    feeds: FeedStore,
    downloads: DownloadStore,
    pruner: Arc<Pruner>,
    ytdlp: Arc<YtdlpRunner>,
}

impl StateReconciler {
    pub fn new(
        feeds: FeedStore,
        downloads: DownloadStore,
        pruner: Arc<Pruner>,
        ytdlp: Arc<YtdlpRunner>,
    ) -> Self {
        Self {
            feeds,
            downloads,
            pruner,
            ytdlp,
        }
    }

    /// Synchronize configuration and database; returns the ids of enabled,
    /// successfully reconciled feeds, ready for scheduling.
    pub async fn reconcile_startup_state(
        &self,
        feed_configs: &BTreeMap<String, FeedConfig>,
    ) -> anyhow::Result<Vec<String>> {
        let existing: BTreeMap<String, Feed> = self
            .feeds
            .get_feeds(None)
            .await?
            .into_iter()
            .map(|feed| (feed.id.clone(), feed))
            .collect();

        let all_ids: BTreeSet<&String> =
            feed_configs.keys().chain(existing.keys()).collect();

        let mut ready = Vec::new();
        for id in all_ids {
            let outcome = match (feed_configs.get(id), existing.get(id)) {
                (Some(config), None) => self.create_feed(id, config).await,
                (None, Some(_)) => self.remove_feed(id).await,
                (Some(config), Some(feed)) => self.handle_existing_feed(feed, config).await,
                (None, None) => continue,
            };

            match outcome {
                Ok(()) => {
                    if feed_configs.get(id).is_some_and(|c| c.enabled) {
                        ready.push(id.clone());
                    }
                }
                Err(e) => {
                    error!(feed_id = %id, %e, "feed reconciliation failed; omitting from ready set");
                }
            }
        }

        info!(ready_count = ready.len(), "startup state reconciled");
        Ok(ready)
    }

    async fn create_feed(&self, feed_id: &str, config: &FeedConfig) -> Result<(), ReconcileError> {
        let (source_url, resolved_url, source_type) = match config.url.as_deref() {
            Some(url) => {
                let (resolved, source_type) = self
                    .ytdlp
                    .determine_fetch_strategy(feed_id, url)
                    .map_err(|e| reconcile_err(feed_id, &e))?;
                (Some(url.to_string()), Some(resolved), source_type)
            }
            None => (None, None, SourceType::Manual),
        };

        // a configured `since` seeds the watermark so the first fetch
        // window starts there instead of at the epoch sentinel
        let initial_sync = config.since.unwrap_or_else(constants::min_sync_date);

        let now = Utc::now();
        let overrides = config.metadata.clone().unwrap_or_default();
        let feed = Feed {
            id: feed_id.to_string(),
            is_enabled: config.enabled,
            source_type,
            source_url,
            resolved_url,
            created_at: now,
            updated_at: now,
            last_successful_sync: initial_sync,
            last_failed_sync: None,
            last_rss_generation: None,
            consecutive_failures: 0,
            total_downloads: 0,
            since: config.since,
            keep_last: config.keep_last,
            title: overrides.title,
            subtitle: overrides.subtitle,
            description: overrides.description,
            language: overrides.language,
            author: overrides.author,
            author_email: overrides
                .author_email
                .unwrap_or_else(|| constants::feed::DEFAULT_AUTHOR_EMAIL.to_string()),
            category: overrides.category,
            podcast_type: overrides.podcast_type.unwrap_or(PodcastType::Episodic),
            explicit: overrides.explicit.unwrap_or(false),
            remote_image_url: overrides.image_url,
            image_ext: None,
            transcript_lang: config.transcript_lang.clone(),
            transcript_source_priority: transcript_priority_string(config),
        };
        self.feeds
            .upsert_feed(&feed)
            .await
            .map_err(|e| reconcile_err(feed_id, &e))?;
        info!(feed_id, %source_type, "feed created from configuration");
        Ok(())
    }

    async fn remove_feed(&self, feed_id: &str) -> Result<(), ReconcileError> {
        info!(feed_id, "feed removed from configuration; archiving");
        self.pruner
            .archive_feed(feed_id)
            .await
            .map(|_| ())
            .map_err(|e| reconcile_err(feed_id, &e))
    }

    async fn handle_existing_feed(
        &self,
        feed: &Feed,
        config: &FeedConfig,
    ) -> Result<(), ReconcileError> {
        let feed_id = &feed.id;

        // url change: the error history belongs to the old source
        if config.url != feed.source_url {
            let (source_url, resolved_url, source_type) = match config.url.as_deref() {
                Some(url) => {
                    let (resolved, source_type) = self
                        .ytdlp
                        .determine_fetch_strategy(feed_id, url)
                        .map_err(|e| reconcile_err(feed_id, &e))?;
                    (Some(url.to_string()), Some(resolved), source_type)
                }
                None => (None, None, SourceType::Manual),
            };
            self.feeds
                .update_feed_source(
                    feed_id,
                    source_url.as_deref(),
                    resolved_url.as_deref(),
                    source_type,
                )
                .await
                .map_err(|e| reconcile_err(feed_id, &e))?;
            info!(feed_id, "feed source url changed");
        }

        if config.enabled != feed.is_enabled {
            self.feeds
                .set_feed_enabled(feed_id, config.enabled)
                .await
                .map_err(|e| reconcile_err(feed_id, &e))?;
            info!(feed_id, enabled = config.enabled, "feed enablement changed");
        }

        let metadata_update = overrides_to_update(config);
        self.feeds
            .update_feed_metadata(feed_id, &metadata_update)
            .await
            .map_err(|e| reconcile_err(feed_id, &e))?;

        self.apply_retention_changes(feed, config).await
    }

    /// Retention relaxations restore archived rows; tightenings are left
    /// to the next regular prune.
    async fn apply_retention_changes(
        &self,
        feed: &Feed,
        config: &FeedConfig,
    ) -> Result<(), ReconcileError> {
        let feed_id = &feed.id;
        let since_expanded = match (feed.since, config.since) {
            (Some(old), Some(new)) => new < old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let keep_last_delta = match (feed.keep_last, config.keep_last) {
            (Some(old), Some(new)) if new > old => Some(Some(new - old)),
            // cap removed entirely: unbounded restore, gated by `since`
            (Some(_), None) => Some(None),
            _ => None,
        };

        if feed.since != config.since || feed.keep_last != config.keep_last {
            self.feeds
                .set_feed_retention(feed_id, config.since, config.keep_last)
                .await
                .map_err(|e| reconcile_err(feed_id, &e))?;
        }

        let quota: Option<i64> = if since_expanded {
            match config.keep_last {
                Some(keep_last) => {
                    let current = self
                        .downloads
                        .count_downloads_by_status(DownloadStatus::Downloaded, Some(feed_id))
                        .await
                        .map_err(|e| reconcile_err(feed_id, &e))?;
                    Some((keep_last - current).max(0))
                }
                None => None,
            }
        } else if let Some(delta) = keep_last_delta {
            delta
        } else {
            return Ok(());
        };

        // candidates: archived rows the new policy would have kept
        let mut candidates = self
            .downloads
            .get_downloads_by_status(
                DownloadStatus::Archived,
                Some(feed_id),
                config.since,
                -1,
                0,
            )
            .await
            .map_err(|e| reconcile_err(feed_id, &e))?;
        candidates.sort_by(|a, b| b.published.cmp(&a.published).then(b.id.cmp(&a.id)));
        if let Some(quota) = quota {
            candidates.truncate(quota.max(0) as usize);
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = candidates.into_iter().map(|d| d.id).collect();
        let restored = self
            .downloads
            .requeue_downloads(feed_id, Some(&ids), Some(DownloadStatus::Archived))
            .await
            .map_err(|e| reconcile_err(feed_id, &e))?;
        info!(feed_id, restored, "retention relaxation restored archived items");
        Ok(())
    }
}

fn overrides_to_update(config: &FeedConfig) -> FeedMetadataUpdate {
    let overrides = config.metadata.clone().unwrap_or_else(FeedMetadataOverrides::default);
    FeedMetadataUpdate {
        title: overrides.title,
        subtitle: overrides.subtitle,
        description: overrides.description,
        language: overrides.language,
        author: overrides.author,
        author_email: overrides.author_email,
        category: overrides.category,
        podcast_type: overrides.podcast_type,
        explicit: overrides.explicit,
        remote_image_url: overrides.image_url,
        transcript_lang: config.transcript_lang.clone(),
        transcript_source_priority: transcript_priority_string(config),
    }
}

fn transcript_priority_string(config: &FeedConfig) -> Option<String> {
    config.transcript_source_priority.as_ref().map(|priority| {
        priority
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    })
}

fn reconcile_err(feed_id: &str, source: &dyn std::fmt::Display) -> ReconcileError {
    ReconcileError {
        feed_id: feed_id.to_string(),
        reason: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedSchedule;
    use crate::cron::CronExpression;
    use crate::db::download_store::tests::sample_download;
    use crate::db::test_pool;
    use crate::ffmpeg::Ffprobe;
    use crate::fsutil::FileManager;
    use crate::path::PathManager;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use url::Url;

    fn config(url: Option<&str>) -> FeedConfig {
        FeedConfig {
            url: url.map(str::to_string),
            schedule: match url {
                Some(_) => FeedSchedule::Cron(CronExpression::parse("@hourly").unwrap()),
                None => FeedSchedule::Manual,
            },
            enabled: true,
            keep_last: None,
            since: None,
            max_errors: 3,
            yt_args: None,
            metadata: None,
            transcript_lang: None,
            transcript_source_priority: None,
        }
    }

    async fn reconciler(dir: &TempDir) -> (StateReconciler, FeedStore, DownloadStore) {
        let pool = test_pool().await;
        let feeds = FeedStore::new(pool.clone());
        let downloads = DownloadStore::new(pool);
        let files = FileManager::new(PathManager::new(
            dir.path().to_path_buf(),
            Url::parse("http://localhost:8024").unwrap(),
        ));
        let ytdlp = Arc::new(YtdlpRunner::new(
            "/nonexistent/yt-dlp",
            Ffprobe::new("/nonexistent/ffprobe"),
        ));
        let pruner = Arc::new(Pruner::new(feeds.clone(), downloads.clone(), files));
        (
            StateReconciler::new(feeds.clone(), downloads.clone(), pruner, ytdlp),
            feeds,
            downloads,
        )
    }

    #[tokio::test]
    async fn creates_feeds_from_config() {
        let dir = TempDir::new().unwrap();
        let (reconciler, feeds, _) = reconciler(&dir).await;

        let mut configs = BTreeMap::new();
        configs.insert(
            "yt".to_string(),
            config(Some("https://www.youtube.com/@SomeCreator")),
        );
        configs.insert("inbox".to_string(), config(None));

        let ready = reconciler.reconcile_startup_state(&configs).await.unwrap();
        assert_eq!(ready, vec!["inbox", "yt"]);

        let yt = feeds.get_feed_by_id("yt").await.unwrap();
        assert_eq!(yt.source_type, SourceType::Channel);
        assert_eq!(
            yt.resolved_url.as_deref(),
            Some("https://www.youtube.com/@SomeCreator/videos")
        );
        assert_eq!(yt.last_successful_sync, constants::min_sync_date());

        let inbox = feeds.get_feed_by_id("inbox").await.unwrap();
        assert_eq!(inbox.source_type, SourceType::Manual);
        assert!(inbox.source_url.is_none());
    }

    #[tokio::test]
    async fn configured_since_seeds_the_watermark() {
        let dir = TempDir::new().unwrap();
        let (reconciler, feeds, _) = reconciler(&dir).await;

        let since = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
        let mut cfg = config(Some("https://youtu.be/abc"));
        cfg.since = Some(since);
        let mut configs = BTreeMap::new();
        configs.insert("f".to_string(), cfg);

        reconciler.reconcile_startup_state(&configs).await.unwrap();
        let feed = feeds.get_feed_by_id("f").await.unwrap();
        assert_eq!(feed.last_successful_sync, since);
        assert_eq!(feed.since, Some(since));
    }

    #[tokio::test]
    async fn removed_feeds_are_archived_and_disabled() {
        let dir = TempDir::new().unwrap();
        let (reconciler, feeds, downloads) = reconciler(&dir).await;

        // first run creates the feed with one downloaded row
        let mut configs = BTreeMap::new();
        configs.insert("gone".to_string(), config(Some("https://youtu.be/abc")));
        reconciler.reconcile_startup_state(&configs).await.unwrap();
        let mut d = sample_download("gone", "v");
        d.status = DownloadStatus::Downloaded;
        downloads.upsert_download(&d).await.unwrap();

        // second run without the feed
        let ready = reconciler
            .reconcile_startup_state(&BTreeMap::new())
            .await
            .unwrap();
        assert!(ready.is_empty());
        assert!(!feeds.get_feed_by_id("gone").await.unwrap().is_enabled);
        assert_eq!(
            downloads.get_download_by_id("gone", "v").await.unwrap().status,
            DownloadStatus::Archived
        );
    }

    #[tokio::test]
    async fn since_expansion_restores_archived_rows_in_range() {
        let dir = TempDir::new().unwrap();
        let (reconciler, feeds, downloads) = reconciler(&dir).await;

        let old_since = Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap();
        let mut cfg = config(Some("https://youtu.be/abc"));
        cfg.since = Some(old_since);
        let mut configs = BTreeMap::new();
        configs.insert("f".to_string(), cfg.clone());
        reconciler.reconcile_startup_state(&configs).await.unwrap();

        for (id, (y, m, d)) in [
            ("aug", (2024, 8, 1)),
            ("jun", (2024, 6, 1)),
        ] {
            let mut row = sample_download("f", id);
            row.published = Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap();
            row.status = DownloadStatus::Archived;
            downloads.upsert_download(&row).await.unwrap();
        }

        // config moves `since` back to july: the august row comes back
        cfg.since = Some(Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap());
        configs.insert("f".to_string(), cfg);
        reconciler.reconcile_startup_state(&configs).await.unwrap();

        assert_eq!(
            downloads.get_download_by_id("f", "aug").await.unwrap().status,
            DownloadStatus::Queued
        );
        assert_eq!(
            downloads.get_download_by_id("f", "jun").await.unwrap().status,
            DownloadStatus::Archived
        );
        let feed = feeds.get_feed_by_id("f").await.unwrap();
        assert_eq!(
            feed.since,
            Some(Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn keep_last_increase_restores_up_to_the_delta() {
        let dir = TempDir::new().unwrap();
        let (reconciler, _, downloads) = reconciler(&dir).await;

        let mut cfg = config(Some("https://youtu.be/abc"));
        cfg.keep_last = Some(1);
        let mut configs = BTreeMap::new();
        configs.insert("f".to_string(), cfg.clone());
        reconciler.reconcile_startup_state(&configs).await.unwrap();

        for (id, day) in [("d1", 1), ("d2", 2), ("d3", 3)] {
            let mut row = sample_download("f", id);
            row.published = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
            row.status = DownloadStatus::Archived;
            downloads.upsert_download(&row).await.unwrap();
        }

        cfg.keep_last = Some(3);
        configs.insert("f".to_string(), cfg);
        reconciler.reconcile_startup_state(&configs).await.unwrap();

        // delta of 2: the two newest archived rows return to the queue
        assert_eq!(
            downloads.get_download_by_id("f", "d3").await.unwrap().status,
            DownloadStatus::Queued
        );
        assert_eq!(
            downloads.get_download_by_id("f", "d2").await.unwrap().status,
            DownloadStatus::Queued
        );
        assert_eq!(
            downloads.get_download_by_id("f", "d1").await.unwrap().status,
            DownloadStatus::Archived
        );
    }

    #[tokio::test]
    async fn stricter_retention_restores_nothing() {
        let dir = TempDir::new().unwrap();
        let (reconciler, _, downloads) = reconciler(&dir).await;

        let mut cfg = config(Some("https://youtu.be/abc"));
        cfg.keep_last = Some(5);
        let mut configs = BTreeMap::new();
        configs.insert("f".to_string(), cfg.clone());
        reconciler.reconcile_startup_state(&configs).await.unwrap();

        let mut row = sample_download("f", "old");
        row.status = DownloadStatus::Archived;
        downloads.upsert_download(&row).await.unwrap();

        cfg.keep_last = Some(2);
        cfg.since = Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        configs.insert("f".to_string(), cfg);
        reconciler.reconcile_startup_state(&configs).await.unwrap();

        assert_eq!(
            downloads.get_download_by_id("f", "old").await.unwrap().status,
            DownloadStatus::Archived
        );
    }

    #[tokio::test]
    async fn disabled_feeds_reconcile_but_are_not_ready() {
        let dir = TempDir::new().unwrap();
        let (reconciler, feeds, _) = reconciler(&dir).await;

        let mut cfg = config(Some("https://youtu.be/abc"));
        cfg.enabled = false;
        let mut configs = BTreeMap::new();
        configs.insert("f".to_string(), cfg);

        let ready = reconciler.reconcile_startup_state(&configs).await.unwrap();
        assert!(ready.is_empty());
        assert!(!feeds.get_feed_by_id("f").await.unwrap().is_enabled);
    }
}
