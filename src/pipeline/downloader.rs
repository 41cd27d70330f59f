//! Download phase: drain the queued set to downloaded
//!
//! Each queued item is handled independently: metadata refresh and the
//! thumbnail/transcript sidecars are best-effort, only the media fetch
//! itself decides success. A failing item bumps its retry counter and the
//! loop moves on.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::db::types::{Download, DownloadStatus, Feed, TranscriptSource};
use crate::db::{DownloadStore, DownloadUpdate, FeedStore};
use crate::error::{DatabaseError, DownloadError, YtdlpError};
use crate::fsutil::FileManager;
use crate::image::ImageDownloader;
use crate::transcript::TranscriptDownloader;
use crate::ytdlp::YtdlpRunner;

use super::enqueuer::Enqueuer;

/// Counters for one run of the download phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadPhaseResult {
    pub success_count: usize,
    pub failure_count: usize,
}

pub struct Downloader {
    feeds: FeedStore,
    downloads: DownloadStore,
    files: FileManager,
    ytdlp: Arc<YtdlpRunner>,
    images: Arc<ImageDownloader>,
    transcripts: Arc<TranscriptDownloader>,
    enqueuer: Arc<Enqueuer>,
}

impl Downloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feeds: FeedStore,
        downloads: DownloadStore,
        files: FileManager,
        ytdlp: Arc<YtdlpRunner>,
        images: Arc<ImageDownloader>,
        transcripts: Arc<TranscriptDownloader>,
        enqueuer: Arc<Enqueuer>,
    ) -> Self {
        Self {
            feeds,
            downloads,
            files,
            ytdlp,
            images,
            transcripts,
            enqueuer,
        }
    }

    /// Fetch media for every queued item of a feed, oldest first.
    ///
    /// `limit = -1` drains the whole queue. Returns per-item success and
    /// failure counts; only infrastructure failures (store access) abort
    /// the phase.
    pub async fn download_queued(
        &self,
        feed_id: &str,
        feed_config: &FeedConfig,
        cookies_path: Option<&Path>,
        limit: i64,
    ) -> Result<DownloadPhaseResult, DatabaseError> {
        let feed = self.feeds.get_feed_by_id(feed_id).await?;
        let queue = self
            .downloads
            .get_downloads_by_status(DownloadStatus::Queued, Some(feed_id), None, limit, 0)
            .await?;
        if queue.is_empty() {
            debug!(feed_id, "queue empty, nothing to download");
            return Ok(DownloadPhaseResult::default());
        }

        let mut result = DownloadPhaseResult::default();
        for item in queue {
            match self
                .download_one(&feed, feed_config, item, cookies_path)
                .await
            {
                Ok(()) => result.success_count += 1,
                Err(e) => {
                    warn!(
                        feed_id = %e.feed_id,
                        download_id = %e.download_id,
                        error = %e.source,
                        "download failed"
                    );
                    result.failure_count += 1;
                }
            }
        }

        info!(
            feed_id,
            success_count = result.success_count,
            failure_count = result.failure_count,
            "download phase complete"
        );
        Ok(result)
    }

    async fn download_one(
        &self,
        feed: &Feed,
        feed_config: &FeedConfig,
        item: Download,
        cookies_path: Option<&Path>,
    ) -> Result<(), DownloadError> {
        let user_args = feed_config.yt_args_vec();
        let priority = feed.transcript_priority();

        // 1. metadata refresh; purely best-effort
        let item = match self
            .enqueuer
            .refresh_metadata(
                &item,
                &user_args,
                feed.transcript_lang.as_deref(),
                &priority,
                cookies_path,
            )
            .await
        {
            Ok(outcome) if !outcome.changed_fields.is_empty() => {
                debug!(
                    feed_id = %feed.id,
                    download_id = %item.id,
                    changed = ?outcome.changed_fields,
                    "metadata refreshed before download"
                );
                self.downloads
                    .get_download_by_id(&feed.id, &item.id)
                    .await
                    .unwrap_or(item)
            }
            Ok(_) => item,
            Err(e) => {
                debug!(feed_id = %feed.id, download_id = %item.id, %e, "metadata refresh failed");
                item
            }
        };

        // 2. the media itself; the one step that decides success
        let target_dir = self
            .files
            .ensure_feed_dirs(&feed.id)
            .await
            .map_err(|e| self.item_error(&item, io_failure(&e)))?;
        let media_path = match self
            .ytdlp
            .download_media_to_file(&item, &user_args, &target_dir, cookies_path)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                self.record_failure(&item, &e, feed_config.max_errors).await;
                return Err(self.item_error(&item, e));
            }
        };

        // 3 + 4. sidecars; failures logged, never fatal
        self.fetch_thumbnail(feed, &item).await;
        self.fetch_transcript(feed, &item, cookies_path).await;

        // 5. record the result from what actually landed on disk
        let ext = media_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(&item.ext)
            .to_string();
        let filesize = self
            .files
            .file_size(&media_path)
            .await
            .ok()
            .flatten()
            .unwrap_or(0) as i64;
        self.downloads
            .mark_as_downloaded(&feed.id, &item.id, &ext, filesize)
            .await
            .map_err(|e| self.item_error(&item, io_failure(&e)))?;

        info!(feed_id = %feed.id, download_id = %item.id, filesize, "media downloaded");
        Ok(())
    }

    async fn fetch_thumbnail(&self, feed: &Feed, item: &Download) {
        let Some(thumbnail_url) = item.remote_thumbnail_url.as_deref() else {
            return;
        };
        match self
            .images
            .download_item_thumbnail(&feed.id, &item.id, thumbnail_url)
            .await
        {
            Ok(ext) => {
                let update = DownloadUpdate {
                    thumbnail_ext: Some(ext),
                    ..Default::default()
                };
                if let Err(e) = self
                    .downloads
                    .update_download(&feed.id, &item.id, &update)
                    .await
                {
                    warn!(feed_id = %feed.id, download_id = %item.id, %e, "failed to record thumbnail");
                }
            }
            Err(e) => {
                debug!(feed_id = %feed.id, download_id = %item.id, %e, "thumbnail fetch failed");
            }
        }
    }

    async fn fetch_transcript(&self, feed: &Feed, item: &Download, cookies_path: Option<&Path>) {
        let Some(lang) = item
            .transcript_lang
            .as_deref()
            .or(feed.transcript_lang.as_deref())
        else {
            return;
        };
        let source = match item.transcript_source {
            Some(TranscriptSource::Creator) => TranscriptSource::Creator,
            Some(TranscriptSource::Auto) => TranscriptSource::Auto,
            Some(TranscriptSource::NotAvailable) | None => return,
        };

        match self
            .transcripts
            .download_transcript(&feed.id, &item.id, &item.source_url, lang, source, cookies_path)
            .await
        {
            Ok(true) => {
                let update = DownloadUpdate {
                    transcript_ext: Some(crate::transcript::TRANSCRIPT_EXT.to_string()),
                    transcript_lang: Some(lang.to_string()),
                    transcript_source: Some(source),
                    ..Default::default()
                };
                if let Err(e) = self
                    .downloads
                    .update_download(&feed.id, &item.id, &update)
                    .await
                {
                    warn!(feed_id = %feed.id, download_id = %item.id, %e, "failed to record transcript");
                }
            }
            Ok(false) => {
                let update = DownloadUpdate {
                    transcript_source: Some(TranscriptSource::NotAvailable),
                    ..Default::default()
                };
                if let Err(e) = self
                    .downloads
                    .update_download(&feed.id, &item.id, &update)
                    .await
                {
                    warn!(feed_id = %feed.id, download_id = %item.id, %e, "failed to record transcript absence");
                }
            }
            Err(e) => {
                debug!(feed_id = %feed.id, download_id = %item.id, %e, "transcript fetch failed");
            }
        }
    }

    /// Bump retries and keep the extractor's stderr tail for diagnosis.
    async fn record_failure(&self, item: &Download, error: &YtdlpError, max_errors: i64) {
        if let YtdlpError::NonZeroExit { stderr_tail, .. } = error {
            let update = DownloadUpdate {
                download_logs: Some(Some(stderr_tail.clone())),
                ..Default::default()
            };
            if let Err(e) = self
                .downloads
                .update_download(&item.feed_id, &item.id, &update)
                .await
            {
                warn!(feed_id = %item.feed_id, download_id = %item.id, %e, "failed to store download log");
            }
        }
        if let Err(e) = self
            .downloads
            .bump_retries(&item.feed_id, &item.id, &error.to_string(), max_errors)
            .await
        {
            warn!(feed_id = %item.feed_id, download_id = %item.id, %e, "failed to bump retries");
        }
    }

    fn item_error(&self, item: &Download, source: YtdlpError) -> DownloadError {
        DownloadError {
            feed_id: item.feed_id.clone(),
            download_id: item.id.clone(),
            source,
        }
    }
}

fn io_failure(e: &dyn std::fmt::Display) -> YtdlpError {
    YtdlpError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        e.to_string(),
    ))
}
