//! Typed view over the extractor's JSON metadata
//!
//! yt-dlp emits one JSON object per entry with a large, loosely specified
//! field set. This wrapper centralizes the accessors the handlers need so
//! field-name knowledge lives in one place.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// One parsed metadata object from the extractor's stdout.
#[derive(Debug, Clone)]
pub struct YtdlpInfo(Value);

impl YtdlpInfo {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(line).map(Self)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    fn f64_field(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn description(&self) -> Option<&str> {
        self.str_field("description")
    }

    pub fn webpage_url(&self) -> Option<&str> {
        self.str_field("webpage_url")
    }

    pub fn original_url(&self) -> Option<&str> {
        self.str_field("original_url")
    }

    /// Direct media URL, when the extractor resolved one.
    pub fn media_url(&self) -> Option<&str> {
        self.str_field("url")
    }

    pub fn ext(&self) -> Option<&str> {
        self.str_field("ext")
    }

    pub fn extractor(&self) -> Option<&str> {
        self.str_field("extractor_key").or_else(|| self.str_field("extractor"))
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.str_field("thumbnail")
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.f64_field("duration").map(|d| d.round() as i64)
    }

    pub fn filesize(&self) -> Option<i64> {
        self.f64_field("filesize")
            .or_else(|| self.f64_field("filesize_approx"))
            .map(|s| s as i64)
    }

    pub fn playlist_index(&self) -> Option<i64> {
        self.0.get("playlist_index").and_then(Value::as_i64)
    }

    /// `is_live` / `live_status` distilled to one question: is this entry
    /// still pending (live now, scheduled, or not yet fully processed)?
    pub fn is_pending_broadcast(&self) -> bool {
        if self.0.get("is_live").and_then(Value::as_bool) == Some(true) {
            return true;
        }
        matches!(
            self.str_field("live_status"),
            Some("is_live") | Some("is_upcoming") | Some("post_live")
        )
    }

    /// Best publication instant: exact timestamps first, then the
    /// day-granular `upload_date`.
    pub fn published(&self) -> Option<DateTime<Utc>> {
        for key in ["timestamp", "release_timestamp"] {
            if let Some(epoch) = self.f64_field(key) {
                if let Some(dt) = DateTime::from_timestamp(epoch as i64, 0) {
                    return Some(dt);
                }
            }
        }
        let raw = self.str_field("upload_date")?;
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(DateTime::from_naive_utc_and_offset(midnight, Utc))
    }

    /// Languages with creator-provided subtitles.
    pub fn has_subtitles(&self, lang: &str) -> bool {
        self.lang_map_contains("subtitles", lang)
    }

    /// Languages with auto-generated captions.
    pub fn has_automatic_captions(&self, lang: &str) -> bool {
        self.lang_map_contains("automatic_captions", lang)
    }

    fn lang_map_contains(&self, key: &str, lang: &str) -> bool {
        self.0
            .get(key)
            .and_then(Value::as_object)
            .is_some_and(|map| {
                map.keys()
                    .any(|k| k == lang || k.split('-').next() == Some(lang))
            })
    }
}
