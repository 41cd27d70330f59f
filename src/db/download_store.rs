//! Download persistence operations

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::types::{Download, DownloadStatus, TranscriptSource};
use crate::error::DatabaseError;

/// Partial update of a download's metadata; `None` fields stay untouched.
///
/// Lifecycle columns (`status`, `retries`, `last_error`) are deliberately
/// absent: they move only through the dedicated transition operations.
#[derive(Debug, Clone, Default)]
pub struct DownloadUpdate {
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub ext: Option<String>,
    pub mime_type: Option<String>,
    pub filesize: Option<i64>,
    pub playlist_index: Option<i64>,
    pub remote_thumbnail_url: Option<String>,
    pub thumbnail_ext: Option<String>,
    pub transcript_ext: Option<String>,
    pub transcript_lang: Option<String>,
    pub transcript_source: Option<TranscriptSource>,
    /// `Some(None)` clears the stored log tail
    pub download_logs: Option<Option<String>>,
}

impl DownloadUpdate {
    pub fn is_empty(&self) -> bool {
        self.source_url.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.published.is_none()
            && self.duration.is_none()
            && self.ext.is_none()
            && self.mime_type.is_none()
            && self.filesize.is_none()
            && self.playlist_index.is_none()
            && self.remote_thumbnail_url.is_none()
            && self.thumbnail_ext.is_none()
            && self.transcript_ext.is_none()
            && self.transcript_lang.is_none()
            && self.transcript_source.is_none()
            && self.download_logs.is_none()
    }
}

/// Result of a retry bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBumpOutcome {
    pub new_retries: i64,
    pub final_status: DownloadStatus,
    pub transitioned_to_error: bool,
}

/// The only legal mutation path for `downloads` rows.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    pool: SqlitePool,
}

impl DownloadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite a download by `(feed_id, id)`.
    ///
    /// `discovered_at`, `updated_at` and `downloaded_at` are owned by the
    /// database once the row exists. Everything else, including the
    /// lifecycle columns, takes the incoming value; callers decide whether
    /// an overwrite is appropriate for the row's current state.
    pub async fn upsert_download(&self, download: &Download) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO downloads (
                feed_id, id, source_url, title, description, published,
                duration, ext, mime_type, filesize, status, retries,
                last_error, discovered_at, updated_at, downloaded_at,
                playlist_index, download_logs, remote_thumbnail_url,
                thumbnail_ext, transcript_ext, transcript_lang,
                transcript_source
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            ON CONFLICT(feed_id, id) DO UPDATE SET
                source_url = excluded.source_url,
                title = excluded.title,
                description = excluded.description,
                published = excluded.published,
                duration = excluded.duration,
                ext = excluded.ext,
                mime_type = excluded.mime_type,
                filesize = excluded.filesize,
                status = excluded.status,
                retries = excluded.retries,
                last_error = excluded.last_error,
                playlist_index = excluded.playlist_index,
                download_logs = excluded.download_logs,
                remote_thumbnail_url = excluded.remote_thumbnail_url,
                thumbnail_ext = excluded.thumbnail_ext,
                transcript_ext = excluded.transcript_ext,
                transcript_lang = excluded.transcript_lang,
                transcript_source = excluded.transcript_source
            "#,
        )
        .bind(&download.feed_id)
        .bind(&download.id)
        .bind(&download.source_url)
        .bind(&download.title)
        .bind(&download.description)
        .bind(download.published)
        .bind(download.duration)
        .bind(&download.ext)
        .bind(&download.mime_type)
        .bind(download.filesize)
        .bind(download.status)
        .bind(download.retries)
        .bind(&download.last_error)
        .bind(download.discovered_at)
        .bind(download.updated_at)
        .bind(download.downloaded_at)
        .bind(download.playlist_index)
        .bind(&download.download_logs)
        .bind(&download.remote_thumbnail_url)
        .bind(&download.thumbnail_ext)
        .bind(&download.transcript_ext)
        .bind(&download.transcript_lang)
        .bind(download.transcript_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply a partial metadata update; a fully-unset update is a no-op.
    pub async fn update_download(
        &self,
        feed_id: &str,
        download_id: &str,
        update: &DownloadUpdate,
    ) -> Result<(), DatabaseError> {
        if update.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE downloads SET ");
        let mut fields = qb.separated(", ");
        if let Some(source_url) = &update.source_url {
            fields
                .push("source_url = ")
                .push_bind_unseparated(source_url);
        }
        if let Some(title) = &update.title {
            fields.push("title = ").push_bind_unseparated(title);
        }
        if let Some(description) = &update.description {
            fields
                .push("description = ")
                .push_bind_unseparated(description);
        }
        if let Some(published) = update.published {
            fields.push("published = ").push_bind_unseparated(published);
        }
        if let Some(duration) = update.duration {
            fields.push("duration = ").push_bind_unseparated(duration);
        }
        if let Some(ext) = &update.ext {
            fields.push("ext = ").push_bind_unseparated(ext);
        }
        if let Some(mime_type) = &update.mime_type {
            fields.push("mime_type = ").push_bind_unseparated(mime_type);
        }
        if let Some(filesize) = update.filesize {
            fields.push("filesize = ").push_bind_unseparated(filesize);
        }
        if let Some(playlist_index) = update.playlist_index {
            fields
                .push("playlist_index = ")
                .push_bind_unseparated(playlist_index);
        }
        if let Some(remote_thumbnail_url) = &update.remote_thumbnail_url {
            fields
                .push("remote_thumbnail_url = ")
                .push_bind_unseparated(remote_thumbnail_url);
        }
        if let Some(thumbnail_ext) = &update.thumbnail_ext {
            fields
                .push("thumbnail_ext = ")
                .push_bind_unseparated(thumbnail_ext);
        }
        if let Some(transcript_ext) = &update.transcript_ext {
            fields
                .push("transcript_ext = ")
                .push_bind_unseparated(transcript_ext);
        }
        if let Some(transcript_lang) = &update.transcript_lang {
            fields
                .push("transcript_lang = ")
                .push_bind_unseparated(transcript_lang);
        }
        if let Some(transcript_source) = update.transcript_source {
            fields
                .push("transcript_source = ")
                .push_bind_unseparated(transcript_source);
        }
        if let Some(download_logs) = &update.download_logs {
            fields
                .push("download_logs = ")
                .push_bind_unseparated(download_logs.clone());
        }
        qb.push(" WHERE feed_id = ")
            .push_bind(feed_id)
            .push(" AND id = ")
            .push_bind(download_id);

        let result = qb.build().execute(&self.pool).await?;
        self.ensure_download_touched(feed_id, download_id, result.rows_affected())
    }

    pub async fn get_download_by_id(
        &self,
        feed_id: &str,
        download_id: &str,
    ) -> Result<Download, DatabaseError> {
        sqlx::query_as::<_, Download>("SELECT * FROM downloads WHERE feed_id = ?1 AND id = ?2")
            .bind(feed_id)
            .bind(download_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::DownloadNotFound {
                feed_id: feed_id.to_string(),
                download_id: download_id.to_string(),
            })
    }

    /// Downloads in a given state, ordered `published ASC, id ASC`.
    ///
    /// `published_after` is inclusive. `limit = -1` means no limit.
    pub async fn get_downloads_by_status(
        &self,
        status: DownloadStatus,
        feed_id: Option<&str>,
        published_after: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Download>, DatabaseError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM downloads WHERE status = ");
        qb.push_bind(status);
        if let Some(feed_id) = feed_id {
            qb.push(" AND feed_id = ").push_bind(feed_id);
        }
        if let Some(published_after) = published_after {
            qb.push(" AND julianday(published) >= julianday(")
                .push_bind(published_after)
                .push(")");
        }
        qb.push(" ORDER BY published ASC, id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        Ok(qb.build_query_as::<Download>().fetch_all(&self.pool).await?)
    }

    pub async fn count_downloads_by_status(
        &self,
        status: DownloadStatus,
        feed_id: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let count = match feed_id {
            Some(feed_id) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM downloads WHERE status = ?1 AND feed_id = ?2",
                )
                .bind(status)
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM downloads WHERE status = ?1")
                    .bind(status)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// Prunable rows beyond the `keep_last` most recent ones.
    ///
    /// Archived and skipped rows are out of scope for retention; upcoming
    /// rows hold no media and are not counted against the cap.
    /// `keep_last <= 0` disables the rule entirely.
    pub async fn get_downloads_to_prune_by_keep_last(
        &self,
        feed_id: &str,
        keep_last: i64,
    ) -> Result<Vec<Download>, DatabaseError> {
        if keep_last <= 0 {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_as::<_, Download>(
            "SELECT * FROM downloads
             WHERE feed_id = ?1
               AND status NOT IN ('archived', 'skipped', 'upcoming')
             ORDER BY published DESC, id DESC
             LIMIT -1 OFFSET ?2",
        )
        .bind(feed_id)
        .bind(keep_last)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Prunable rows published strictly before `cutoff`.
    pub async fn get_downloads_to_prune_by_since(
        &self,
        feed_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Download>, DatabaseError> {
        Ok(sqlx::query_as::<_, Download>(
            "SELECT * FROM downloads
             WHERE feed_id = ?1
               AND julianday(published) < julianday(?2)
               AND status NOT IN ('archived', 'skipped', 'upcoming')
             ORDER BY published ASC, id ASC",
        )
        .bind(feed_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Record a completed media fetch. Clears the error state and the
    /// stored log tail along with it.
    pub async fn mark_as_downloaded(
        &self,
        feed_id: &str,
        download_id: &str,
        ext: &str,
        filesize: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE downloads
             SET status = 'downloaded', ext = ?3, filesize = ?4,
                 last_error = NULL, retries = 0, download_logs = NULL
             WHERE feed_id = ?1 AND id = ?2",
        )
        .bind(feed_id)
        .bind(download_id)
        .bind(ext)
        .bind(filesize)
        .execute(&self.pool)
        .await?;
        self.ensure_download_touched(feed_id, download_id, result.rows_affected())
    }

    /// Promote an upcoming item that has become a VOD.
    ///
    /// Returns `false` when the row exists but is no longer upcoming.
    pub async fn mark_as_queued_from_upcoming(
        &self,
        feed_id: &str,
        download_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE downloads SET status = 'queued'
             WHERE feed_id = ?1 AND id = ?2 AND status = 'upcoming'",
        )
        .bind(feed_id)
        .bind(download_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // distinguish "wrong state" from "missing row"
        self.get_download_by_id(feed_id, download_id).await?;
        Ok(false)
    }

    /// Park a row in the archived state. Retries and the last error are
    /// preserved so an archived error row keeps its history.
    pub async fn archive_download(
        &self,
        feed_id: &str,
        download_id: &str,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE downloads SET status = 'archived' WHERE feed_id = ?1 AND id = ?2",
        )
        .bind(feed_id)
        .bind(download_id)
        .execute(&self.pool)
        .await?;
        self.ensure_download_touched(feed_id, download_id, result.rows_affected())
    }

    /// Bulk transition rows back to queued, resetting their error state.
    ///
    /// Optionally restricted to specific ids and/or a current status.
    /// Returns the number of rows affected.
    pub async fn requeue_downloads(
        &self,
        feed_id: &str,
        ids: Option<&[String]>,
        from_status: Option<DownloadStatus>,
    ) -> Result<u64, DatabaseError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE downloads SET status = 'queued', retries = 0, last_error = NULL
             WHERE feed_id = ",
        );
        qb.push_bind(feed_id);
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(0);
            }
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
            qb.push(")");
        }
        if let Some(from_status) = from_status {
            qb.push(" AND status = ").push_bind(from_status);
        }
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Increment the retry counter after a failed attempt and park the row
    /// in the error state once the threshold is reached.
    pub async fn bump_retries(
        &self,
        feed_id: &str,
        download_id: &str,
        error_message: &str,
        max_allowed_errors: i64,
    ) -> Result<RetryBumpOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, DownloadStatus)> = sqlx::query_as(
            "SELECT retries, status FROM downloads WHERE feed_id = ?1 AND id = ?2",
        )
        .bind(feed_id)
        .bind(download_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (retries, status) = row.ok_or_else(|| DatabaseError::DownloadNotFound {
            feed_id: feed_id.to_string(),
            download_id: download_id.to_string(),
        })?;

        let new_retries = retries + 1;
        let transitioned_to_error =
            new_retries >= max_allowed_errors && status != DownloadStatus::Error;
        let final_status = if new_retries >= max_allowed_errors {
            DownloadStatus::Error
        } else {
            status
        };

        sqlx::query(
            "UPDATE downloads SET retries = ?3, last_error = ?4, status = ?5
             WHERE feed_id = ?1 AND id = ?2",
        )
        .bind(feed_id)
        .bind(download_id)
        .bind(new_retries)
        .bind(error_message)
        .bind(final_status)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RetryBumpOutcome {
            new_retries,
            final_status,
            transitioned_to_error,
        })
    }

    fn ensure_download_touched(
        &self,
        feed_id: &str,
        download_id: &str,
        rows: u64,
    ) -> Result<(), DatabaseError> {
        if rows == 0 {
            return Err(DatabaseError::DownloadNotFound {
                feed_id: feed_id.to_string(),
                download_id: download_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::db::types::tests::test_feed;
    use crate::db::FeedStore;
    use chrono::{Duration, TimeZone};

    pub(crate) fn sample_download(feed_id: &str, id: &str) -> Download {
        Download {
            feed_id: feed_id.to_string(),
            id: id.to_string(),
            source_url: format!("https://example.com/watch?v={id}"),
            title: format!("video {id}"),
            description: None,
            published: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            duration: 60,
            ext: "mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            filesize: 0,
            status: DownloadStatus::Queued,
            retries: 0,
            last_error: None,
            discovered_at: Utc::now(),
            updated_at: Utc::now(),
            downloaded_at: None,
            playlist_index: None,
            download_logs: None,
            remote_thumbnail_url: None,
            thumbnail_ext: None,
            transcript_ext: None,
            transcript_lang: None,
            transcript_source: None,
        }
    }

    async fn store_with_feed(feed_id: &str) -> (DownloadStore, FeedStore) {
        let pool = test_pool().await;
        let feeds = FeedStore::new(pool.clone());
        feeds.upsert_feed(&test_feed(feed_id)).await.unwrap();
        (DownloadStore::new(pool), feeds)
    }

    #[tokio::test]
    async fn upsert_overwrites_but_keeps_discovered_at() {
        let (store, _) = store_with_feed("f").await;
        let mut d = sample_download("f", "a");
        store.upsert_download(&d).await.unwrap();
        let discovered = store.get_download_by_id("f", "a").await.unwrap().discovered_at;

        d.title = "renamed".to_string();
        d.discovered_at = Utc::now() + Duration::days(1);
        store.upsert_download(&d).await.unwrap();

        let reloaded = store.get_download_by_id("f", "a").await.unwrap();
        assert_eq!(reloaded.title, "renamed");
        assert_eq!(reloaded.discovered_at, discovered);
    }

    #[tokio::test]
    async fn status_listing_is_ordered_and_limited() {
        let (store, _) = store_with_feed("f").await;
        for (id, day) in [("c", 3), ("a", 1), ("b", 2), ("a2", 1)] {
            let mut d = sample_download("f", id);
            d.published = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
            store.upsert_download(&d).await.unwrap();
        }

        let all = store
            .get_downloads_by_status(DownloadStatus::Queued, Some("f"), None, -1, 0)
            .await
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        // same publish instant ties break by id
        assert_eq!(ids, vec!["a", "a2", "b", "c"]);

        let limited = store
            .get_downloads_by_status(DownloadStatus::Queued, Some("f"), None, 2, 1)
            .await
            .unwrap();
        let ids: Vec<&str> = limited.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "b"]);

        let after = store
            .get_downloads_by_status(
                DownloadStatus::Queued,
                Some("f"),
                Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()),
                -1,
                0,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = after.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn keep_last_pruning_selects_the_tail() {
        let (store, _) = store_with_feed("f").await;
        for (id, day, status) in [
            ("old", 1, DownloadStatus::Downloaded),
            ("mid", 2, DownloadStatus::Downloaded),
            ("new", 3, DownloadStatus::Downloaded),
            ("skipped", 1, DownloadStatus::Skipped),
            ("upcoming", 1, DownloadStatus::Upcoming),
        ] {
            let mut d = sample_download("f", id);
            d.published = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
            d.status = status;
            store.upsert_download(&d).await.unwrap();
        }

        let prune = store
            .get_downloads_to_prune_by_keep_last("f", 1)
            .await
            .unwrap();
        let ids: Vec<&str> = prune.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["mid", "old"]);

        // zero and negative disable the rule
        assert!(store
            .get_downloads_to_prune_by_keep_last("f", 0)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_downloads_to_prune_by_keep_last("f", -3)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn since_pruning_is_strict_and_skips_protected_rows() {
        let (store, _) = store_with_feed("f").await;
        let cutoff = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        for (id, day, status) in [
            ("older", 1, DownloadStatus::Downloaded),
            ("at-cutoff", 2, DownloadStatus::Downloaded),
            ("newer", 3, DownloadStatus::Queued),
            ("archived-old", 1, DownloadStatus::Archived),
            ("skipped-old", 1, DownloadStatus::Skipped),
        ] {
            let mut d = sample_download("f", id);
            d.published = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
            d.status = status;
            store.upsert_download(&d).await.unwrap();
        }

        let prune = store
            .get_downloads_to_prune_by_since("f", cutoff)
            .await
            .unwrap();
        let ids: Vec<&str> = prune.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["older"]);
    }

    #[tokio::test]
    async fn mark_as_downloaded_clears_error_state() {
        let (store, _) = store_with_feed("f").await;
        let mut d = sample_download("f", "a");
        d.retries = 2;
        d.last_error = Some("boom".to_string());
        d.download_logs = Some("log tail".to_string());
        store.upsert_download(&d).await.unwrap();

        store.mark_as_downloaded("f", "a", "m4a", 2048).await.unwrap();
        let reloaded = store.get_download_by_id("f", "a").await.unwrap();
        assert_eq!(reloaded.status, DownloadStatus::Downloaded);
        assert_eq!(reloaded.ext, "m4a");
        assert_eq!(reloaded.filesize, 2048);
        assert_eq!(reloaded.retries, 0);
        assert!(reloaded.last_error.is_none());
        assert!(reloaded.download_logs.is_none());
    }

    #[tokio::test]
    async fn upcoming_promotion_only_applies_to_upcoming_rows() {
        let (store, _) = store_with_feed("f").await;
        let mut d = sample_download("f", "live");
        d.status = DownloadStatus::Upcoming;
        store.upsert_download(&d).await.unwrap();

        assert!(store.mark_as_queued_from_upcoming("f", "live").await.unwrap());
        assert!(!store.mark_as_queued_from_upcoming("f", "live").await.unwrap());
        let err = store
            .mark_as_queued_from_upcoming("f", "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::DownloadNotFound { .. }));
    }

    #[tokio::test]
    async fn archive_preserves_error_history() {
        let (store, _) = store_with_feed("f").await;
        let mut d = sample_download("f", "a");
        d.status = DownloadStatus::Error;
        d.retries = 3;
        d.last_error = Some("gone".to_string());
        store.upsert_download(&d).await.unwrap();

        store.archive_download("f", "a").await.unwrap();
        let reloaded = store.get_download_by_id("f", "a").await.unwrap();
        assert_eq!(reloaded.status, DownloadStatus::Archived);
        assert_eq!(reloaded.retries, 3);
        assert_eq!(reloaded.last_error.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn requeue_resets_error_state_and_counts() {
        let (store, _) = store_with_feed("f").await;
        for id in ["a", "b", "c"] {
            let mut d = sample_download("f", id);
            d.status = DownloadStatus::Error;
            d.retries = 3;
            d.last_error = Some("x".to_string());
            store.upsert_download(&d).await.unwrap();
        }
        let mut skipped = sample_download("f", "s");
        skipped.status = DownloadStatus::Skipped;
        store.upsert_download(&skipped).await.unwrap();

        let count = store
            .requeue_downloads("f", None, Some(DownloadStatus::Error))
            .await
            .unwrap();
        assert_eq!(count, 3);

        let queued = store
            .get_downloads_by_status(DownloadStatus::Queued, Some("f"), None, -1, 0)
            .await
            .unwrap();
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().all(|d| d.retries == 0 && d.last_error.is_none()));
        assert_eq!(
            store
                .get_download_by_id("f", "s")
                .await
                .unwrap()
                .status,
            DownloadStatus::Skipped
        );
    }

    #[tokio::test]
    async fn bump_retries_transitions_at_threshold() {
        let (store, _) = store_with_feed("f").await;
        store.upsert_download(&sample_download("f", "a")).await.unwrap();

        let first = store.bump_retries("f", "a", "e1", 3).await.unwrap();
        assert_eq!(first.new_retries, 1);
        assert_eq!(first.final_status, DownloadStatus::Queued);
        assert!(!first.transitioned_to_error);

        let second = store.bump_retries("f", "a", "e2", 3).await.unwrap();
        assert!(!second.transitioned_to_error);

        let third = store.bump_retries("f", "a", "e3", 3).await.unwrap();
        assert_eq!(third.new_retries, 3);
        assert_eq!(third.final_status, DownloadStatus::Error);
        assert!(third.transitioned_to_error);

        // further bumps stay in error without re-announcing the transition
        let fourth = store.bump_retries("f", "a", "e4", 3).await.unwrap();
        assert_eq!(fourth.final_status, DownloadStatus::Error);
        assert!(!fourth.transitioned_to_error);

        let reloaded = store.get_download_by_id("f", "a").await.unwrap();
        assert_eq!(reloaded.last_error.as_deref(), Some("e4"));
        assert_eq!(reloaded.retries, 4);
    }
}
