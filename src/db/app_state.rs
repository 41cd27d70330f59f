//! Process-global key/value state
//!
//! Holds only monotonically updated maintenance timestamps (when the
//! extractor binary was last self-updated, and similar). Single-writer by
//! convention; each write is its own short transaction.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DatabaseError;

/// When `yt-dlp -U` last ran successfully.
pub const LAST_YTDLP_UPDATE_KEY: &str = "last_yt_dlp_update";

#[derive(Debug, Clone)]
pub struct AppStateStore {
    pool: SqlitePool,
}

impl AppStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_timestamp(
        &self,
        key: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|raw| raw.parse::<DateTime<Utc>>().ok()))
    }

    pub async fn set_timestamp(
        &self,
        key: &str,
        value: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO app_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value.to_rfc3339())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn timestamps_round_trip() {
        let store = AppStateStore::new(test_pool().await);
        assert!(store
            .get_timestamp(LAST_YTDLP_UPDATE_KEY)
            .await
            .unwrap()
            .is_none());

        let now = Utc::now();
        store.set_timestamp(LAST_YTDLP_UPDATE_KEY, now).await.unwrap();
        let loaded = store
            .get_timestamp(LAST_YTDLP_UPDATE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.timestamp_millis(), now.timestamp_millis());

        // overwrite wins
        let later = now + chrono::Duration::hours(1);
        store.set_timestamp(LAST_YTDLP_UPDATE_KEY, later).await.unwrap();
        let loaded = store
            .get_timestamp(LAST_YTDLP_UPDATE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.timestamp_millis(), later.timestamp_millis());
    }
}
