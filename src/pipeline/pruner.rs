//! Prune phase: retention policy enforcement
//!
//! Archives excess or stale rows and deletes their files. The database is
//! the source of truth: a media file that is already gone counts as
//! successfully deleted, and one failing item never aborts the batch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::types::{Download, DownloadStatus};
use crate::db::{DownloadStore, FeedStore};
use crate::error::PruneError;
use crate::fsutil::FileManager;

/// Counters for one prune run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub archived_count: usize,
    pub files_deleted_count: usize,
}

pub struct Pruner {
    feeds: FeedStore,
    downloads: DownloadStore,
    files: FileManager,
}

impl Pruner {
    pub fn new(feeds: FeedStore, downloads: DownloadStore, files: FileManager) -> Self {
        Self {
            feeds,
            downloads,
            files,
        }
    }

    /// Apply the feed's retention policy.
    ///
    /// The candidate set is the union of the keep-last overflow (when
    /// `keep_last > 0`) and everything published strictly before
    /// `prune_before_date`.
    pub async fn prune_feed_downloads(
        &self,
        feed_id: &str,
        keep_last: Option<i64>,
        prune_before_date: Option<DateTime<Utc>>,
    ) -> Result<PruneResult, PruneError> {
        let mut candidates: Vec<Download> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        if let Some(keep_last) = keep_last.filter(|n| *n > 0) {
            for download in self
                .downloads
                .get_downloads_to_prune_by_keep_last(feed_id, keep_last)
                .await
                .map_err(|source| prune_err(feed_id, source))?
            {
                if seen.insert(download.id.clone()) {
                    candidates.push(download);
                }
            }
        }
        if let Some(cutoff) = prune_before_date {
            for download in self
                .downloads
                .get_downloads_to_prune_by_since(feed_id, cutoff)
                .await
                .map_err(|source| prune_err(feed_id, source))?
            {
                if seen.insert(download.id.clone()) {
                    candidates.push(download);
                }
            }
        }

        if candidates.is_empty() {
            debug!(feed_id, "nothing to prune");
            return Ok(PruneResult::default());
        }

        let result = self.archive_batch(feed_id, candidates).await;
        info!(
            feed_id,
            archived_count = result.archived_count,
            files_deleted_count = result.files_deleted_count,
            "prune phase complete"
        );
        Ok(result)
    }

    /// Archive every non-terminal item of a feed, delete its files and
    /// disable the feed. Used when a feed disappears from configuration.
    pub async fn archive_feed(&self, feed_id: &str) -> Result<PruneResult, PruneError> {
        let mut candidates = Vec::new();
        for status in [
            DownloadStatus::Downloaded,
            DownloadStatus::Queued,
            DownloadStatus::Upcoming,
            DownloadStatus::Error,
        ] {
            candidates.extend(
                self.downloads
                    .get_downloads_by_status(status, Some(feed_id), None, -1, 0)
                    .await
                    .map_err(|source| prune_err(feed_id, source))?,
            );
        }

        let mut result = self.archive_batch(feed_id, candidates).await;

        // the generated document must not outlive the feed
        if let Ok(xml_path) = self.files.paths().feed_xml_path(feed_id) {
            match self.files.delete_file(&xml_path).await {
                Ok(true) => result.files_deleted_count += 1,
                Ok(false) => {}
                Err(e) => warn!(feed_id, %e, "failed to delete feed document"),
            }
        }

        self.feeds
            .set_feed_enabled(feed_id, false)
            .await
            .map_err(|source| prune_err(feed_id, source))?;

        info!(
            feed_id,
            archived_count = result.archived_count,
            files_deleted_count = result.files_deleted_count,
            "feed archived"
        );
        Ok(result)
    }

    async fn archive_batch(&self, feed_id: &str, candidates: Vec<Download>) -> PruneResult {
        let mut result = PruneResult::default();
        for download in candidates {
            match self.archive_one(feed_id, &download).await {
                Ok(files_deleted) => {
                    result.archived_count += 1;
                    result.files_deleted_count += files_deleted;
                }
                Err(e) => {
                    warn!(feed_id, download_id = %download.id, %e, "failed to archive download");
                }
            }
        }
        result
    }

    async fn archive_one(
        &self,
        feed_id: &str,
        download: &Download,
    ) -> Result<usize, PruneError> {
        let mut files_deleted = 0;
        if download.status == DownloadStatus::Downloaded {
            files_deleted += self.delete_files_for(feed_id, download).await;
        }
        self.downloads
            .archive_download(feed_id, &download.id)
            .await
            .map_err(|source| prune_err(feed_id, source))?;
        Ok(files_deleted)
    }

    /// Delete media plus sidecars. Already-missing files count as success.
    async fn delete_files_for(&self, feed_id: &str, download: &Download) -> usize {
        let mut exts: Vec<&str> = vec![&download.ext];
        if let Some(thumbnail_ext) = &download.thumbnail_ext {
            exts.push(thumbnail_ext);
        }
        if let Some(transcript_ext) = &download.transcript_ext {
            exts.push(transcript_ext);
        }

        let mut deleted = 0;
        for ext in exts {
            let Ok(path) = self.files.paths().media_path(feed_id, &download.id, ext) else {
                continue;
            };
            match self.files.delete_file(&path).await {
                Ok(true) => deleted += 1,
                Ok(false) => {
                    debug!(feed_id, download_id = %download.id, ext, "file already gone");
                }
                Err(e) => {
                    warn!(feed_id, download_id = %download.id, %e, "failed to delete file");
                }
            }
        }
        deleted
    }
}

fn prune_err(feed_id: &str, source: crate::error::DatabaseError) -> PruneError {
    PruneError {
        feed_id: feed_id.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::download_store::tests::sample_download;
    use crate::db::test_pool;
    use crate::db::types::tests::test_feed;
    use crate::path::PathManager;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use url::Url;

    async fn pruner(dir: &TempDir) -> (Pruner, DownloadStore, FeedStore) {
        let pool = test_pool().await;
        let feeds = FeedStore::new(pool.clone());
        let downloads = DownloadStore::new(pool);
        let files = FileManager::new(PathManager::new(
            dir.path().to_path_buf(),
            Url::parse("http://localhost:8024").unwrap(),
        ));
        feeds.upsert_feed(&test_feed("f")).await.unwrap();
        (
            Pruner::new(feeds.clone(), downloads.clone(), files),
            downloads,
            feeds,
        )
    }

    async fn insert(
        downloads: &DownloadStore,
        id: &str,
        day: u32,
        status: DownloadStatus,
    ) {
        let mut d = sample_download("f", id);
        d.published = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
        d.status = status;
        downloads.upsert_download(&d).await.unwrap();
    }

    #[tokio::test]
    async fn keep_last_archives_overflow_and_deletes_files() {
        let dir = TempDir::new().unwrap();
        let (pruner, downloads, feeds) = pruner(&dir).await;

        for (id, day) in [("d5", 5), ("d3", 3), ("d1", 1)] {
            insert(&downloads, id, day, DownloadStatus::Downloaded).await;
        }
        // materialize the media files
        let feed_dir = dir.path().join("f");
        tokio::fs::create_dir_all(&feed_dir).await.unwrap();
        for id in ["d5", "d3", "d1"] {
            tokio::fs::write(feed_dir.join(format!("{id}.mp4")), b"x")
                .await
                .unwrap();
        }

        let result = pruner
            .prune_feed_downloads("f", Some(1), None)
            .await
            .unwrap();
        assert_eq!(result.archived_count, 2);
        assert_eq!(result.files_deleted_count, 2);

        // newest stays, rest archived, counter reflects it
        assert_eq!(
            downloads.get_download_by_id("f", "d5").await.unwrap().status,
            DownloadStatus::Downloaded
        );
        for id in ["d3", "d1"] {
            assert_eq!(
                downloads.get_download_by_id("f", id).await.unwrap().status,
                DownloadStatus::Archived
            );
            assert!(!feed_dir.join(format!("{id}.mp4")).exists());
        }
        assert!(feed_dir.join("d5.mp4").exists());
        assert_eq!(feeds.get_feed_by_id("f").await.unwrap().total_downloads, 1);
    }

    #[tokio::test]
    async fn missing_files_count_as_deleted_zero_but_still_archive() {
        let dir = TempDir::new().unwrap();
        let (pruner, downloads, _) = pruner(&dir).await;
        insert(&downloads, "ghost", 1, DownloadStatus::Downloaded).await;

        let cutoff = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let result = pruner
            .prune_feed_downloads("f", None, Some(cutoff))
            .await
            .unwrap();
        assert_eq!(result.archived_count, 1);
        assert_eq!(result.files_deleted_count, 0);
        assert_eq!(
            downloads.get_download_by_id("f", "ghost").await.unwrap().status,
            DownloadStatus::Archived
        );
    }

    #[tokio::test]
    async fn union_of_rules_does_not_double_archive() {
        let dir = TempDir::new().unwrap();
        let (pruner, downloads, _) = pruner(&dir).await;
        // one item matches both the keep-last overflow and the cutoff
        insert(&downloads, "both", 1, DownloadStatus::Queued).await;
        insert(&downloads, "kept", 9, DownloadStatus::Queued).await;

        let cutoff = Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap();
        let result = pruner
            .prune_feed_downloads("f", Some(1), Some(cutoff))
            .await
            .unwrap();
        assert_eq!(result.archived_count, 1);
    }

    #[tokio::test]
    async fn keep_last_zero_means_rule_disabled() {
        let dir = TempDir::new().unwrap();
        let (pruner, downloads, _) = pruner(&dir).await;
        for (id, day) in [("a", 1), ("b", 2)] {
            insert(&downloads, id, day, DownloadStatus::Downloaded).await;
        }

        let result = pruner
            .prune_feed_downloads("f", Some(0), None)
            .await
            .unwrap();
        assert_eq!(result, PruneResult::default());
        assert_eq!(
            downloads
                .count_downloads_by_status(DownloadStatus::Downloaded, Some("f"))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn archive_feed_archives_all_non_terminal_rows_and_disables() {
        let dir = TempDir::new().unwrap();
        let (pruner, downloads, feeds) = pruner(&dir).await;
        insert(&downloads, "done", 1, DownloadStatus::Downloaded).await;
        insert(&downloads, "queued", 2, DownloadStatus::Queued).await;
        insert(&downloads, "live", 3, DownloadStatus::Upcoming).await;
        insert(&downloads, "bad", 4, DownloadStatus::Error).await;
        insert(&downloads, "skipped", 5, DownloadStatus::Skipped).await;

        let result = pruner.archive_feed("f").await.unwrap();
        assert_eq!(result.archived_count, 4);

        for id in ["done", "queued", "live", "bad"] {
            assert_eq!(
                downloads.get_download_by_id("f", id).await.unwrap().status,
                DownloadStatus::Archived,
                "{id}"
            );
        }
        // skipped rows are operator-owned and stay put
        assert_eq!(
            downloads
                .get_download_by_id("f", "skipped")
                .await
                .unwrap()
                .status,
            DownloadStatus::Skipped
        );
        assert!(!feeds.get_feed_by_id("f").await.unwrap().is_enabled);
    }
}
