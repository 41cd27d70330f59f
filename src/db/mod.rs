//! Persistence layer
//!
//! SQLite reached through an async pool. The stores in this module are the
//! only legal paths for mutating persisted state; schema and triggers are
//! created idempotently on startup. Triggers own the derived pieces of
//! state: `feeds.total_downloads`, both `updated_at` columns, and the
//! once-only `downloads.downloaded_at` stamp.

pub mod app_state;
pub mod download_store;
pub mod feed_store;
pub mod types;

pub use app_state::{AppStateStore, LAST_YTDLP_UPDATE_KEY};
pub use download_store::{DownloadStore, DownloadUpdate, RetryBumpOutcome};
pub use feed_store::{FeedMetadataUpdate, FeedStore};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::DatabaseError;

/// Millisecond-precision UTC timestamp in the same shape the bind encoder
/// writes, so trigger-written and store-written values stay comparable.
const SQL_NOW: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now') || '+00:00'";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS feeds (
  id                         TEXT PRIMARY KEY,
  is_enabled                 INTEGER NOT NULL DEFAULT 1,
  source_type                TEXT NOT NULL,
  source_url                 TEXT,
  resolved_url               TEXT,
  created_at                 TEXT NOT NULL,
  updated_at                 TEXT NOT NULL,
  last_successful_sync       TEXT NOT NULL,
  last_failed_sync           TEXT,
  last_rss_generation        TEXT,
  consecutive_failures       INTEGER NOT NULL DEFAULT 0,
  total_downloads            INTEGER NOT NULL DEFAULT 0,
  since                      TEXT,
  keep_last                  INTEGER,
  title                      TEXT,
  subtitle                   TEXT,
  description                TEXT,
  language                   TEXT,
  author                     TEXT,
  author_email               TEXT NOT NULL,
  category                   TEXT,
  podcast_type               TEXT NOT NULL DEFAULT 'episodic',
  explicit                   INTEGER NOT NULL DEFAULT 0,
  remote_image_url           TEXT,
  image_ext                  TEXT,
  transcript_lang            TEXT,
  transcript_source_priority TEXT
);

CREATE TABLE IF NOT EXISTS downloads (
  feed_id              TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
  id                   TEXT NOT NULL,
  source_url           TEXT NOT NULL,
  title                TEXT NOT NULL,
  description          TEXT,
  published            TEXT NOT NULL,
  duration             INTEGER NOT NULL DEFAULT 0,
  ext                  TEXT NOT NULL,
  mime_type            TEXT NOT NULL,
  filesize             INTEGER NOT NULL DEFAULT 0,
  status               TEXT NOT NULL,
  retries              INTEGER NOT NULL DEFAULT 0,
  last_error           TEXT,
  discovered_at        TEXT NOT NULL,
  updated_at           TEXT NOT NULL,
  downloaded_at        TEXT,
  playlist_index       INTEGER,
  download_logs        TEXT,
  remote_thumbnail_url TEXT,
  thumbnail_ext        TEXT,
  transcript_ext       TEXT,
  transcript_lang      TEXT,
  transcript_source    TEXT,
  PRIMARY KEY (feed_id, id)
);

CREATE INDEX IF NOT EXISTS idx_downloads_feed_status
  ON downloads(feed_id, status);
CREATE INDEX IF NOT EXISTS idx_downloads_status_published
  ON downloads(status, published);

CREATE TABLE IF NOT EXISTS app_state (
  key        TEXT PRIMARY KEY,
  value      TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#;

/// Open (creating if necessary) the database and ensure schema + triggers.
pub async fn open_pool(database_url: &str) -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    initialize_schema(&pool).await?;
    Ok(pool)
}

async fn initialize_schema(pool: &SqlitePool) -> Result<(), DatabaseError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    for trigger in trigger_sql() {
        sqlx::raw_sql(&trigger).execute(pool).await?;
    }
    Ok(())
}

fn trigger_sql() -> Vec<String> {
    vec![
        // total_downloads bookkeeping: one trigger per way a row can
        // enter or leave the downloaded state.
        "CREATE TRIGGER IF NOT EXISTS trg_downloads_insert_downloaded
         AFTER INSERT ON downloads
         WHEN NEW.status = 'downloaded'
         BEGIN
           UPDATE feeds SET total_downloads = total_downloads + 1
             WHERE id = NEW.feed_id;
         END;"
            .to_string(),
        "CREATE TRIGGER IF NOT EXISTS trg_downloads_delete_downloaded
         AFTER DELETE ON downloads
         WHEN OLD.status = 'downloaded'
         BEGIN
           UPDATE feeds SET total_downloads = total_downloads - 1
             WHERE id = OLD.feed_id;
         END;"
            .to_string(),
        "CREATE TRIGGER IF NOT EXISTS trg_downloads_status_to_downloaded
         AFTER UPDATE OF status ON downloads
         WHEN NEW.status = 'downloaded' AND OLD.status <> 'downloaded'
         BEGIN
           UPDATE feeds SET total_downloads = total_downloads + 1
             WHERE id = NEW.feed_id;
         END;"
            .to_string(),
        "CREATE TRIGGER IF NOT EXISTS trg_downloads_status_from_downloaded
         AFTER UPDATE OF status ON downloads
         WHEN OLD.status = 'downloaded' AND NEW.status <> 'downloaded'
         BEGIN
           UPDATE feeds SET total_downloads = total_downloads - 1
             WHERE id = OLD.feed_id;
         END;"
            .to_string(),
        // updated_at refresh; the WHEN guard keeps explicit writes of the
        // column (none exist today) from being clobbered.
        format!(
            "CREATE TRIGGER IF NOT EXISTS trg_feeds_touch_updated_at
             AFTER UPDATE ON feeds
             WHEN NEW.updated_at = OLD.updated_at
             BEGIN
               UPDATE feeds SET updated_at = {SQL_NOW} WHERE id = NEW.id;
             END;"
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS trg_downloads_touch_updated_at
             AFTER UPDATE ON downloads
             WHEN NEW.updated_at = OLD.updated_at
             BEGIN
               UPDATE downloads SET updated_at = {SQL_NOW}
                 WHERE feed_id = NEW.feed_id AND id = NEW.id;
             END;"
        ),
        // downloaded_at stamps exactly once, on the first transition in.
        format!(
            "CREATE TRIGGER IF NOT EXISTS trg_downloads_set_downloaded_at
             AFTER UPDATE OF status ON downloads
             WHEN NEW.status = 'downloaded' AND OLD.status <> 'downloaded'
                  AND OLD.downloaded_at IS NULL
             BEGIN
               UPDATE downloads SET downloaded_at = {SQL_NOW}
                 WHERE feed_id = NEW.feed_id AND id = NEW.id;
             END;"
        ),
    ]
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    initialize_schema(&pool).await.expect("schema");
    pool
}
