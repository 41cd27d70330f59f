//! Feed persistence operations

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::types::{Feed, PodcastType, SourceType};
use crate::error::DatabaseError;

/// Partial update of a feed's podcast metadata; `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct FeedMetadataUpdate {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub category: Option<String>,
    pub podcast_type: Option<PodcastType>,
    pub explicit: Option<bool>,
    pub remote_image_url: Option<String>,
    pub transcript_lang: Option<String>,
    pub transcript_source_priority: Option<String>,
}

impl FeedMetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.subtitle.is_none()
            && self.description.is_none()
            && self.language.is_none()
            && self.author.is_none()
            && self.author_email.is_none()
            && self.category.is_none()
            && self.podcast_type.is_none()
            && self.explicit.is_none()
            && self.remote_image_url.is_none()
            && self.transcript_lang.is_none()
            && self.transcript_source_priority.is_none()
    }
}

/// The only legal mutation path for `feeds` rows.
#[derive(Debug, Clone)]
pub struct FeedStore {
    pool: SqlitePool,
}

impl FeedStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite a feed by id.
    ///
    /// `created_at`, `updated_at` and `total_downloads` are owned by the
    /// database once the row exists and are never overwritten here.
    pub async fn upsert_feed(&self, feed: &Feed) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO feeds (
                id, is_enabled, source_type, source_url, resolved_url,
                created_at, updated_at, last_successful_sync, last_failed_sync,
                last_rss_generation, consecutive_failures, total_downloads,
                since, keep_last, title, subtitle, description, language,
                author, author_email, category, podcast_type, explicit,
                remote_image_url, image_ext, transcript_lang,
                transcript_source_priority
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                    ?25, ?26, ?27)
            ON CONFLICT(id) DO UPDATE SET
                is_enabled = excluded.is_enabled,
                source_type = excluded.source_type,
                source_url = excluded.source_url,
                resolved_url = excluded.resolved_url,
                last_successful_sync = excluded.last_successful_sync,
                last_failed_sync = excluded.last_failed_sync,
                last_rss_generation = excluded.last_rss_generation,
                consecutive_failures = excluded.consecutive_failures,
                since = excluded.since,
                keep_last = excluded.keep_last,
                title = excluded.title,
                subtitle = excluded.subtitle,
                description = excluded.description,
                language = excluded.language,
                author = excluded.author,
                author_email = excluded.author_email,
                category = excluded.category,
                podcast_type = excluded.podcast_type,
                explicit = excluded.explicit,
                remote_image_url = excluded.remote_image_url,
                image_ext = excluded.image_ext,
                transcript_lang = excluded.transcript_lang,
                transcript_source_priority = excluded.transcript_source_priority
            "#,
        )
        .bind(&feed.id)
        .bind(feed.is_enabled)
        .bind(feed.source_type)
        .bind(&feed.source_url)
        .bind(&feed.resolved_url)
        .bind(feed.created_at)
        .bind(feed.updated_at)
        .bind(feed.last_successful_sync)
        .bind(feed.last_failed_sync)
        .bind(feed.last_rss_generation)
        .bind(feed.consecutive_failures)
        .bind(feed.total_downloads)
        .bind(feed.since)
        .bind(feed.keep_last)
        .bind(&feed.title)
        .bind(&feed.subtitle)
        .bind(&feed.description)
        .bind(&feed.language)
        .bind(&feed.author)
        .bind(&feed.author_email)
        .bind(&feed.category)
        .bind(feed.podcast_type)
        .bind(feed.explicit)
        .bind(&feed.remote_image_url)
        .bind(&feed.image_ext)
        .bind(&feed.transcript_lang)
        .bind(&feed.transcript_source_priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_feed_by_id(&self, feed_id: &str) -> Result<Feed, DatabaseError> {
        sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?1")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::FeedNotFound {
                feed_id: feed_id.to_string(),
            })
    }

    /// All feeds, ordered by id; optionally only (dis|en)abled ones.
    pub async fn get_feeds(&self, enabled: Option<bool>) -> Result<Vec<Feed>, DatabaseError> {
        let feeds = match enabled {
            Some(enabled) => {
                sqlx::query_as::<_, Feed>(
                    "SELECT * FROM feeds WHERE is_enabled = ?1 ORDER BY id ASC",
                )
                .bind(enabled)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(feeds)
    }

    /// Enable or disable a feed. Enabling wipes the error history: the
    /// operator has signalled the feed should get a fresh start.
    pub async fn set_feed_enabled(&self, feed_id: &str, enabled: bool) -> Result<(), DatabaseError> {
        let result = if enabled {
            sqlx::query(
                "UPDATE feeds
                 SET is_enabled = 1, consecutive_failures = 0, last_failed_sync = NULL
                 WHERE id = ?1",
            )
            .bind(feed_id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE feeds SET is_enabled = 0 WHERE id = ?1")
                .bind(feed_id)
                .execute(&self.pool)
                .await?
        };
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Apply a partial metadata update; a fully-unset update is a no-op.
    pub async fn update_feed_metadata(
        &self,
        feed_id: &str,
        update: &FeedMetadataUpdate,
    ) -> Result<(), DatabaseError> {
        if update.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE feeds SET ");
        let mut fields = qb.separated(", ");
        if let Some(title) = &update.title {
            fields.push("title = ").push_bind_unseparated(title);
        }
        if let Some(subtitle) = &update.subtitle {
            fields.push("subtitle = ").push_bind_unseparated(subtitle);
        }
        if let Some(description) = &update.description {
            fields
                .push("description = ")
                .push_bind_unseparated(description);
        }
        if let Some(language) = &update.language {
            fields.push("language = ").push_bind_unseparated(language);
        }
        if let Some(author) = &update.author {
            fields.push("author = ").push_bind_unseparated(author);
        }
        if let Some(author_email) = &update.author_email {
            fields
                .push("author_email = ")
                .push_bind_unseparated(author_email);
        }
        if let Some(category) = &update.category {
            fields.push("category = ").push_bind_unseparated(category);
        }
        if let Some(podcast_type) = update.podcast_type {
            fields
                .push("podcast_type = ")
                .push_bind_unseparated(podcast_type);
        }
        if let Some(explicit) = update.explicit {
            fields.push("explicit = ").push_bind_unseparated(explicit);
        }
        if let Some(remote_image_url) = &update.remote_image_url {
            fields
                .push("remote_image_url = ")
                .push_bind_unseparated(remote_image_url);
        }
        if let Some(transcript_lang) = &update.transcript_lang {
            fields
                .push("transcript_lang = ")
                .push_bind_unseparated(transcript_lang);
        }
        if let Some(priority) = &update.transcript_source_priority {
            fields
                .push("transcript_source_priority = ")
                .push_bind_unseparated(priority);
        }
        qb.push(" WHERE id = ").push_bind(feed_id);

        let result = qb.build().execute(&self.pool).await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Point the feed at a (possibly re-resolved) source. The failure
    /// counter resets: accumulated errors belonged to the old source.
    pub async fn update_feed_source(
        &self,
        feed_id: &str,
        source_url: Option<&str>,
        resolved_url: Option<&str>,
        source_type: SourceType,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE feeds SET source_url = ?2, resolved_url = ?3, source_type = ?4,
                 consecutive_failures = 0
             WHERE id = ?1",
        )
        .bind(feed_id)
        .bind(source_url)
        .bind(resolved_url)
        .bind(source_type)
        .execute(&self.pool)
        .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Replace the retention policy columns.
    pub async fn set_feed_retention(
        &self,
        feed_id: &str,
        since: Option<DateTime<Utc>>,
        keep_last: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET since = ?2, keep_last = ?3 WHERE id = ?1")
            .bind(feed_id)
            .bind(since)
            .bind(keep_last)
            .execute(&self.pool)
            .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Record a successful sync.
    ///
    /// The watermark only moves forward; `julianday` comparison keeps the
    /// check robust against textual format differences. Success also wipes
    /// the consecutive-failure counter.
    pub async fn mark_sync_success(
        &self,
        feed_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let at = at.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            "UPDATE feeds
             SET last_successful_sync = CASE
                   WHEN julianday(last_successful_sync) < julianday(?2) THEN ?2
                   ELSE last_successful_sync
                 END,
                 consecutive_failures = 0
             WHERE id = ?1",
        )
        .bind(feed_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Explicit watermark reset (admin escape hatch); the only sanctioned
    /// way to move `last_successful_sync` backwards.
    pub async fn reset_sync_watermark(
        &self,
        feed_id: &str,
        to: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET last_successful_sync = ?2 WHERE id = ?1")
            .bind(feed_id)
            .bind(to)
            .execute(&self.pool)
            .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    pub async fn mark_sync_failure(&self, feed_id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE feeds
             SET last_failed_sync = ?2,
                 consecutive_failures = consecutive_failures + 1
             WHERE id = ?1",
        )
        .bind(feed_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    pub async fn mark_rss_generated(&self, feed_id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET last_rss_generation = ?2 WHERE id = ?1")
            .bind(feed_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Record the extension of the locally materialized cover art.
    pub async fn set_feed_image_ext(
        &self,
        feed_id: &str,
        image_ext: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET image_ext = ?2 WHERE id = ?1")
            .bind(feed_id)
            .bind(image_ext)
            .execute(&self.pool)
            .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())
    }

    /// Reconcile the trigger-maintained counter for a feed being
    /// re-populated out of band.
    pub async fn update_total_downloads(&self, feed_id: &str) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM downloads WHERE feed_id = ?1 AND status = 'downloaded'",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        let result = sqlx::query("UPDATE feeds SET total_downloads = ?2 WHERE id = ?1")
            .bind(feed_id)
            .bind(count)
            .execute(&self.pool)
            .await?;
        self.ensure_feed_touched(feed_id, result.rows_affected())?;
        Ok(count)
    }

    fn ensure_feed_touched(&self, feed_id: &str, rows: u64) -> Result<(), DatabaseError> {
        if rows == 0 {
            return Err(DatabaseError::FeedNotFound {
                feed_id: feed_id.to_string(),
            });
        }
        Ok(())
    }
}
