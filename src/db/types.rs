//! Row types and enumerations for the persistence layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single download.
///
/// Discovered items start as `Upcoming` (live/premiere not yet concluded)
/// or `Queued` (regular VOD). `Archived` is reversible only through state
/// reconciliation; `Skipped` requires admin action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Upcoming,
    Queued,
    Downloaded,
    Error,
    Skipped,
    Archived,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Upcoming => "upcoming",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloaded => "downloaded",
            DownloadStatus::Error => "error",
            DownloadStatus::Skipped => "skipped",
            DownloadStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of source a feed points at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Channel,
    Playlist,
    SingleVideo,
    Manual,
    Unknown,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceType::Channel => "channel",
            SourceType::Playlist => "playlist",
            SourceType::SingleVideo => "single_video",
            SourceType::Manual => "manual",
            SourceType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Where a transcript came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Creator,
    Auto,
    NotAvailable,
}

impl std::fmt::Display for TranscriptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TranscriptSource::Creator => "creator",
            TranscriptSource::Auto => "auto",
            TranscriptSource::NotAvailable => "not_available",
        };
        f.write_str(s)
    }
}

/// iTunes channel ordering semantics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PodcastType {
    Episodic,
    Serial,
}

impl std::fmt::Display for PodcastType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodcastType::Episodic => "episodic",
            PodcastType::Serial => "serial",
        };
        f.write_str(s)
    }
}

/// One configured feed, as persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: String,
    pub is_enabled: bool,
    pub source_type: SourceType,
    /// Null for manual-only feeds
    pub source_url: Option<String>,
    /// Canonical URL the extractor queries; may differ from `source_url`
    /// when a channel root was rewritten to its videos tab
    pub resolved_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Watermark: all publications up to this instant have been considered
    pub last_successful_sync: DateTime<Utc>,
    pub last_failed_sync: Option<DateTime<Utc>>,
    pub last_rss_generation: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    /// Count of rows in the downloaded state; maintained by triggers
    pub total_downloads: i64,
    pub since: Option<DateTime<Utc>>,
    pub keep_last: Option<i64>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub author: Option<String>,
    pub author_email: String,
    pub category: Option<String>,
    pub podcast_type: PodcastType,
    pub explicit: bool,
    pub remote_image_url: Option<String>,
    /// Set once cover art has been fetched and materialized locally
    pub image_ext: Option<String>,
    pub transcript_lang: Option<String>,
    /// Comma-joined priority list, e.g. "creator,auto"
    pub transcript_source_priority: Option<String>,
}

impl Feed {
    /// Channel title falling back to the feed id.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    /// Parsed transcript source priority (empty when transcripts are off).
    pub fn transcript_priority(&self) -> Vec<TranscriptSource> {
        self.transcript_source_priority
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| match part.trim() {
                        "creator" => Some(TranscriptSource::Creator),
                        "auto" => Some(TranscriptSource::Auto),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One discovered item belonging to a feed. Composite key `(feed_id, id)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Download {
    pub feed_id: String,
    /// Extractor-provided stable id
    pub id: String,
    pub source_url: String,
    pub title: String,
    pub description: Option<String>,
    pub published: DateTime<Utc>,
    /// Seconds; 0 for items that have not aired yet
    pub duration: i64,
    pub ext: String,
    pub mime_type: String,
    pub filesize: i64,
    pub status: DownloadStatus,
    pub retries: i64,
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    /// 1-based position within the source playlist, when known
    pub playlist_index: Option<i64>,
    /// Tail of extractor output from the last failed fetch
    pub download_logs: Option<String>,
    pub remote_thumbnail_url: Option<String>,
    pub thumbnail_ext: Option<String>,
    pub transcript_ext: Option<String>,
    pub transcript_lang: Option<String>,
    pub transcript_source: Option<TranscriptSource>,
}

impl Download {
    /// File name of the media object inside the feed directory.
    pub fn media_filename(&self) -> String {
        format!("{}.{}", self.id, self.ext)
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript_ext.is_some()
            && !matches!(self.transcript_source, Some(TranscriptSource::NotAvailable))
    }
}

/// Equality and hashing follow the composite primary key.
impl PartialEq for Download {
    fn eq(&self, other: &Self) -> bool {
        self.feed_id == other.feed_id && self.id == other.id
    }
}

impl Eq for Download {}

impl std::hash::Hash for Download {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.feed_id.hash(state);
        self.id.hash(state);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DownloadStatus::Upcoming,
            DownloadStatus::Queued,
            DownloadStatus::Downloaded,
            DownloadStatus::Error,
            DownloadStatus::Skipped,
            DownloadStatus::Archived,
        ] {
            assert_eq!(status.to_string(), status.as_str());
        }
    }

    #[test]
    fn transcript_priority_parses_comma_list() {
        let feed = Feed {
            transcript_source_priority: Some("creator, auto".to_string()),
            ..test_feed("t")
        };
        assert_eq!(
            feed.transcript_priority(),
            vec![TranscriptSource::Creator, TranscriptSource::Auto]
        );
        let none = Feed {
            transcript_source_priority: None,
            ..test_feed("t")
        };
        assert!(none.transcript_priority().is_empty());
    }

    pub(crate) fn test_feed(id: &str) -> Feed {
        Feed {
            id: id.to_string(),
            is_enabled: true,
            source_type: SourceType::Unknown,
            source_url: None,
            resolved_url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_successful_sync: crate::constants::min_sync_date(),
            last_failed_sync: None,
            last_rss_generation: None,
            consecutive_failures: 0,
            total_downloads: 0,
            since: None,
            keep_last: None,
            title: None,
            subtitle: None,
            description: None,
            language: None,
            author: None,
            author_email: crate::constants::feed::DEFAULT_AUTHOR_EMAIL.to_string(),
            category: None,
            podcast_type: PodcastType::Episodic,
            explicit: false,
            remote_image_url: None,
            image_ext: None,
            transcript_lang: None,
            transcript_source_priority: None,
        }
    }
}
