//! Enqueue phase: reconcile feed state with the upstream source
//!
//! Brings upstream discoveries into the queued set without ever
//! re-queuing downloaded or archived items, and re-polls upcoming items
//! until they turn into VODs. Every step is failure-isolated: one bad
//! item never blocks the rest of the feed.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::db::types::{Download, DownloadStatus, Feed, SourceType};
use crate::db::{DownloadStore, DownloadUpdate, FeedStore};
use crate::error::{DatabaseError, EnqueueError};
use crate::ytdlp::{MetadataFetchRequest, YtdlpRunner};

/// What the enqueue phase reports back to the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueResult {
    /// Items that entered the queued state this run
    pub queued_count: usize,
    /// Instant the upstream fetch started; recorded as the new sync
    /// watermark by the caller on success
    pub sync_candidate: DateTime<Utc>,
}

/// Outcome of a single-download metadata refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub changed_fields: Vec<&'static str>,
    pub thumbnail_url_changed: bool,
    pub transcript_metadata_changed: bool,
}

pub struct Enqueuer {
    feeds: FeedStore,
    downloads: DownloadStore,
    ytdlp: Arc<YtdlpRunner>,
}

impl Enqueuer {
    pub fn new(feeds: FeedStore, downloads: DownloadStore, ytdlp: Arc<YtdlpRunner>) -> Self {
        Self {
            feeds,
            downloads,
            ytdlp,
        }
    }

    /// Run the enqueue phase for one feed.
    pub async fn enqueue_new_downloads(
        &self,
        feed_id: &str,
        feed_config: &FeedConfig,
        fetch_since: DateTime<Utc>,
        fetch_until: Option<DateTime<Utc>>,
        cookies_path: Option<&Path>,
    ) -> Result<EnqueueResult, EnqueueError> {
        let feed = self
            .feeds
            .get_feed_by_id(feed_id)
            .await
            .map_err(|source| db_err(feed_id, source))?;

        let mut queued_count = self
            .process_upcoming(&feed, feed_config, cookies_path)
            .await
            .map_err(|source| db_err(feed_id, source))?;

        // The watermark candidate is the instant the fetch starts, except
        // for date-filtered sources whose window is capped below "now": a
        // backfilling feed has only considered publications up to the cap,
        // and the watermark must not jump past unseen history.
        let fetch_started = Utc::now();
        let date_filtered = matches!(
            feed.source_type,
            SourceType::Channel | SourceType::Playlist | SourceType::Unknown
        );
        let sync_candidate = match fetch_until {
            Some(until) if date_filtered => fetch_started.min(until),
            _ => fetch_started,
        };

        if feed.source_type != SourceType::Manual {
            if let Some(resolved_url) = feed.resolved_url.as_deref().or(feed.source_url.as_deref())
            {
                queued_count += self
                    .fetch_and_merge(
                        &feed,
                        feed_config,
                        resolved_url,
                        fetch_since,
                        fetch_until,
                        cookies_path,
                    )
                    .await?;
            }
        }

        info!(feed_id, queued_count, "enqueue phase complete");
        Ok(EnqueueResult {
            queued_count,
            sync_candidate,
        })
    }

    /// Step 1: re-poll every upcoming item as a single video. A VOD result
    /// promotes the row to queued; failures and ambiguity bump retries.
    async fn process_upcoming(
        &self,
        feed: &Feed,
        feed_config: &FeedConfig,
        cookies_path: Option<&Path>,
    ) -> Result<usize, DatabaseError> {
        let upcoming = self
            .downloads
            .get_downloads_by_status(DownloadStatus::Upcoming, Some(&feed.id), None, -1, 0)
            .await?;
        if upcoming.is_empty() {
            return Ok(0);
        }

        let user_args = feed_config.yt_args_vec();
        let priority = feed.transcript_priority();
        let mut promoted = 0;

        for row in upcoming {
            let fetched = self
                .ytdlp
                .fetch_single_metadata(
                    &feed.id,
                    &row.source_url,
                    &user_args,
                    feed.transcript_lang.as_deref(),
                    &priority,
                    cookies_path,
                )
                .await;

            match fetched {
                Ok(results) if results.len() == 1 => {
                    let fresh = &results[0];
                    if fresh.status == DownloadStatus::Queued {
                        self.downloads
                            .update_download(&feed.id, &row.id, &vod_promotion_update(fresh))
                            .await?;
                        if self
                            .downloads
                            .mark_as_queued_from_upcoming(&feed.id, &row.id)
                            .await?
                        {
                            promoted += 1;
                            info!(feed_id = %feed.id, download_id = %row.id, "upcoming item became a vod");
                        }
                    } else {
                        debug!(feed_id = %feed.id, download_id = %row.id, "still upcoming");
                    }
                }
                Ok(results) => {
                    let reason = format!(
                        "upcoming re-poll returned {} results for {}",
                        results.len(),
                        row.source_url
                    );
                    self.bump_for_upcoming(feed, &row.id, &reason, feed_config.max_errors)
                        .await?;
                }
                Err(e) => {
                    let reason = format!("upcoming re-poll failed: {e}");
                    self.bump_for_upcoming(feed, &row.id, &reason, feed_config.max_errors)
                        .await?;
                }
            }
        }
        Ok(promoted)
    }

    async fn bump_for_upcoming(
        &self,
        feed: &Feed,
        download_id: &str,
        reason: &str,
        max_errors: i64,
    ) -> Result<(), DatabaseError> {
        let outcome = self
            .downloads
            .bump_retries(&feed.id, download_id, reason, max_errors)
            .await?;
        if outcome.transitioned_to_error {
            warn!(
                feed_id = %feed.id,
                download_id,
                retries = outcome.new_retries,
                "upcoming item gave up and moved to error"
            );
        } else {
            debug!(feed_id = %feed.id, download_id, retries = outcome.new_retries, reason, "upcoming re-poll retry recorded");
        }
        Ok(())
    }

    /// Step 2: fetch the upstream window and merge into the database.
    async fn fetch_and_merge(
        &self,
        feed: &Feed,
        feed_config: &FeedConfig,
        resolved_url: &str,
        fetch_since: DateTime<Utc>,
        fetch_until: Option<DateTime<Utc>>,
        cookies_path: Option<&Path>,
    ) -> Result<usize, EnqueueError> {
        let user_args = feed_config.yt_args_vec();
        let priority = feed.transcript_priority();
        let request = MetadataFetchRequest {
            feed_id: &feed.id,
            source_type: feed.source_type,
            source_url: feed.source_url.as_deref().unwrap_or(resolved_url),
            resolved_url,
            user_args: &user_args,
            fetch_since: Some(fetch_since),
            fetch_until,
            keep_last: feed.keep_last,
            transcript_lang: feed.transcript_lang.as_deref(),
            transcript_priority: &priority,
            cookies_path,
        };

        let fetched = self
            .ytdlp
            .fetch_new_downloads_metadata(&request)
            .await
            .map_err(|source| EnqueueError::Fetch {
                feed_id: feed.id.clone(),
                source,
            })?;

        let mut queued = 0;
        for incoming in fetched {
            queued += self
                .merge_incoming(&feed.id, incoming)
                .await
                .map_err(|source| db_err(&feed.id, source))?;
        }
        Ok(queued)
    }

    /// Merge one fetched item with whatever the database already knows.
    ///
    /// Never touches downloaded, archived or skipped rows; never
    /// double-counts rows that are already queued.
    async fn merge_incoming(
        &self,
        feed_id: &str,
        incoming: Download,
    ) -> Result<usize, DatabaseError> {
        let existing = match self.downloads.get_download_by_id(feed_id, &incoming.id).await {
            Ok(existing) => Some(existing),
            Err(DatabaseError::DownloadNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let Some(existing) = existing else {
            let is_queued = incoming.status == DownloadStatus::Queued;
            self.downloads.upsert_download(&incoming).await?;
            return Ok(usize::from(is_queued));
        };

        match (existing.status, incoming.status) {
            // terminal or operator-owned rows are never resurrected here
            (DownloadStatus::Downloaded | DownloadStatus::Archived | DownloadStatus::Skipped, _) => {
                Ok(0)
            }
            // a failed row reappearing upstream gets a clean restart
            (DownloadStatus::Error, DownloadStatus::Queued) => {
                self.downloads.upsert_download(&incoming).await?;
                Ok(1)
            }
            // promotion observed during the bulk fetch
            (DownloadStatus::Upcoming, DownloadStatus::Queued) => {
                self.downloads.upsert_download(&incoming).await?;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    /// Re-fetch a single download's metadata and write back only the
    /// scalar fields that changed. Lifecycle fields are preserved, as is a
    /// duration that is already known.
    pub async fn refresh_metadata(
        &self,
        download: &Download,
        user_args: &[String],
        transcript_lang: Option<&str>,
        transcript_priority: &[crate::db::types::TranscriptSource],
        cookies_path: Option<&Path>,
    ) -> Result<RefreshOutcome, EnqueueError> {
        let results = self
            .ytdlp
            .fetch_single_metadata(
                &download.feed_id,
                &download.source_url,
                user_args,
                transcript_lang,
                transcript_priority,
                cookies_path,
            )
            .await
            .map_err(|source| EnqueueError::Fetch {
                feed_id: download.feed_id.clone(),
                source,
            })?;

        if results.len() != 1 {
            debug!(
                feed_id = %download.feed_id,
                download_id = %download.id,
                results = results.len(),
                "metadata refresh was ambiguous, leaving row untouched"
            );
            return Ok(RefreshOutcome::default());
        }
        let fresh = &results[0];

        let mut outcome = RefreshOutcome::default();
        let mut update = DownloadUpdate::default();

        if fresh.title != download.title {
            update.title = Some(fresh.title.clone());
            outcome.changed_fields.push("title");
        }
        if fresh.description != download.description {
            update.description = fresh.description.clone();
            if update.description.is_some() {
                outcome.changed_fields.push("description");
            }
        }
        if fresh.published != download.published {
            update.published = Some(fresh.published);
            outcome.changed_fields.push("published");
        }
        if fresh.source_url != download.source_url {
            update.source_url = Some(fresh.source_url.clone());
            outcome.changed_fields.push("source_url");
        }
        if download.duration == 0 && fresh.duration > 0 {
            update.duration = Some(fresh.duration);
            outcome.changed_fields.push("duration");
        }
        if download.status != DownloadStatus::Downloaded
            && fresh.status == DownloadStatus::Queued
            && fresh.ext != download.ext
        {
            update.ext = Some(fresh.ext.clone());
            update.mime_type = Some(fresh.mime_type.clone());
            outcome.changed_fields.push("ext");
        }
        if fresh.remote_thumbnail_url != download.remote_thumbnail_url
            && fresh.remote_thumbnail_url.is_some()
        {
            update.remote_thumbnail_url = fresh.remote_thumbnail_url.clone();
            outcome.thumbnail_url_changed = true;
            outcome.changed_fields.push("remote_thumbnail_url");
        }
        if fresh.transcript_source != download.transcript_source
            && fresh.transcript_source.is_some()
        {
            update.transcript_source = fresh.transcript_source;
            update.transcript_lang = fresh.transcript_lang.clone();
            outcome.transcript_metadata_changed = true;
            outcome.changed_fields.push("transcript_source");
        }

        if !update.is_empty() {
            self.downloads
                .update_download(&download.feed_id, &download.id, &update)
                .await
                .map_err(|source| db_err(&download.feed_id, source))?;
        }
        Ok(outcome)
    }
}

/// Fields copied onto an upcoming row the moment it turns into a VOD.
fn vod_promotion_update(fresh: &Download) -> DownloadUpdate {
    DownloadUpdate {
        title: Some(fresh.title.clone()),
        description: fresh.description.clone(),
        published: Some(fresh.published),
        duration: Some(fresh.duration),
        ext: Some(fresh.ext.clone()),
        mime_type: Some(fresh.mime_type.clone()),
        filesize: Some(fresh.filesize),
        remote_thumbnail_url: fresh.remote_thumbnail_url.clone(),
        transcript_source: fresh.transcript_source,
        transcript_lang: fresh.transcript_lang.clone(),
        ..Default::default()
    }
}

fn db_err(feed_id: &str, source: DatabaseError) -> EnqueueError {
    EnqueueError::Database {
        feed_id: feed_id.to_string(),
        source,
    }
}
