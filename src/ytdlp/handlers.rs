//! Per-site metadata handling
//!
//! Each supported site differs in how URLs classify, which JSON fields are
//! authoritative, and which entries must be dropped. Dispatch is a flat
//! match over the handler variant chosen from the URL's host; adding a
//! site means adding a variant.

use chrono::Utc;
use url::Url;

use super::info::YtdlpInfo;
use crate::db::types::{Download, DownloadStatus, SourceType, TranscriptSource};
use crate::error::YtdlpError;

/// Extension used to represent a live or scheduled broadcast that has no
/// media yet.
pub const LIVE_EXT: &str = "live";

/// Site-specific behavior, keyed by source hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHandler {
    Youtube,
    Patreon,
    Twitter,
    Generic,
}

impl SourceHandler {
    /// Pick the handler for a source URL.
    pub fn for_url(url: &str) -> Self {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
        else {
            return SourceHandler::Generic;
        };
        let host = host.trim_start_matches("www.").trim_start_matches("m.");
        if host == "youtube.com" || host == "youtu.be" || host == "music.youtube.com" {
            SourceHandler::Youtube
        } else if host == "patreon.com" {
            SourceHandler::Patreon
        } else if host == "twitter.com" || host == "x.com" {
            SourceHandler::Twitter
        } else {
            SourceHandler::Generic
        }
    }

    /// Classify a URL and resolve the canonical location the extractor
    /// should query. A bare YouTube channel root becomes its videos tab.
    pub fn determine_fetch_strategy(url: &str) -> Result<(String, SourceType), YtdlpError> {
        let parsed = Url::parse(url).map_err(|_| YtdlpError::UnsupportedUrl {
            url: url.to_string(),
        })?;
        let handler = Self::for_url(url);
        let path = parsed.path().trim_end_matches('/');

        let classified = match handler {
            SourceHandler::Youtube => classify_youtube(&parsed, path),
            SourceHandler::Patreon => {
                if path.starts_with("/posts/") {
                    (url.to_string(), SourceType::SingleVideo)
                } else {
                    (url.to_string(), SourceType::Channel)
                }
            }
            SourceHandler::Twitter => {
                if path.contains("/status/") {
                    (url.to_string(), SourceType::SingleVideo)
                } else {
                    (url.to_string(), SourceType::Channel)
                }
            }
            SourceHandler::Generic => (url.to_string(), SourceType::Unknown),
        };
        Ok(classified)
    }

    /// Map one extractor metadata object to a download row.
    ///
    /// Entries the site handler refuses (e.g. Patreon posts without any
    /// media) surface as a filtered-out signal, which callers skip.
    pub fn parse_download(
        &self,
        feed_id: &str,
        info: &YtdlpInfo,
        transcript_lang: Option<&str>,
        transcript_priority: &[TranscriptSource],
    ) -> Result<Download, YtdlpError> {
        let id = info
            .id()
            .ok_or_else(|| missing("id", info))?
            .to_string();
        let pending = info.is_pending_broadcast();

        if let SourceHandler::Patreon = self {
            // text-only posts carry no extension and are not downloads
            if info.ext().is_none() && !pending {
                return Err(YtdlpError::FilteredOut {
                    reason: format!("patreon post {id} has no media attachment"),
                });
            }
        }

        let published = info
            .published()
            .ok_or_else(|| missing("published", info))?;
        let source_url = self.canonical_source_url(info, &id);

        let (status, ext, duration) = if pending {
            (DownloadStatus::Upcoming, LIVE_EXT.to_string(), 0)
        } else {
            let ext = info
                .ext()
                .ok_or_else(|| missing("ext", info))?
                .to_string();
            (
                DownloadStatus::Queued,
                ext,
                info.duration_seconds().unwrap_or(0),
            )
        };
        let mime_type = mime_from_ext(&ext).to_string();

        let transcript_source =
            transcript_availability(info, transcript_lang, transcript_priority);

        let now = Utc::now();
        Ok(Download {
            feed_id: feed_id.to_string(),
            id,
            source_url,
            title: info
                .title()
                .map(str::to_string)
                .unwrap_or_else(|| "untitled".to_string()),
            description: info.description().map(str::to_string),
            published,
            duration,
            ext,
            mime_type,
            filesize: info.filesize().unwrap_or(0),
            status,
            retries: 0,
            last_error: None,
            discovered_at: now,
            updated_at: now,
            downloaded_at: None,
            playlist_index: info.playlist_index(),
            download_logs: None,
            remote_thumbnail_url: info.thumbnail().map(str::to_string),
            thumbnail_ext: None,
            transcript_ext: None,
            transcript_lang: transcript_lang.map(str::to_string),
            transcript_source,
        })
    }

    /// Authoritative item URL: prefer `webpage_url`, then `original_url`,
    /// else rebuild one from the site's canonical shape.
    fn canonical_source_url(&self, info: &YtdlpInfo, id: &str) -> String {
        if let Some(url) = info.webpage_url().or_else(|| info.original_url()) {
            return url.to_string();
        }
        match self {
            SourceHandler::Youtube => format!("https://www.youtube.com/watch?v={id}"),
            SourceHandler::Patreon => format!("https://www.patreon.com/posts/{id}"),
            SourceHandler::Twitter => format!("https://twitter.com/i/status/{id}"),
            SourceHandler::Generic => info
                .media_url()
                .map(str::to_string)
                .unwrap_or_else(|| format!("urn:anypod:{id}")),
        }
    }
}

fn classify_youtube(parsed: &Url, path: &str) -> (String, SourceType) {
    let is_short_host = parsed.host_str().is_some_and(|h| h.ends_with("youtu.be"));
    let has_video_param = parsed
        .query_pairs()
        .any(|(k, _)| k == "v");

    if is_short_host
        || (path == "/watch" && has_video_param)
        || path.starts_with("/shorts/")
        || path.starts_with("/live/")
    {
        return (parsed.to_string(), SourceType::SingleVideo);
    }
    if path == "/playlist" {
        return (parsed.to_string(), SourceType::Playlist);
    }

    let is_channel_root = {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [handle] if handle.starts_with('@') => true,
            ["channel", _] | ["c", _] | ["user", _] => true,
            _ => false,
        }
    };
    if is_channel_root {
        // the videos tab is the enumerable face of a channel
        let resolved = format!("{}/videos", parsed.as_str().trim_end_matches('/'));
        return (resolved, SourceType::Channel);
    }
    // channel with an explicit tab, or anything else youtube-shaped
    (parsed.to_string(), SourceType::Channel)
}

/// Decide which transcript source (if any) the feed's policy selects for
/// this entry. `None` means transcripts are not requested at all.
fn transcript_availability(
    info: &YtdlpInfo,
    lang: Option<&str>,
    priority: &[TranscriptSource],
) -> Option<TranscriptSource> {
    let lang = lang?;
    if priority.is_empty() {
        return None;
    }
    for source in priority {
        let available = match source {
            TranscriptSource::Creator => info.has_subtitles(lang),
            TranscriptSource::Auto => info.has_automatic_captions(lang),
            TranscriptSource::NotAvailable => false,
        };
        if available {
            return Some(*source);
        }
    }
    Some(TranscriptSource::NotAvailable)
}

/// MIME type for a media extension; enclosure types come from here.
pub fn mime_from_ext(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "opus" | "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "vtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

fn missing(field: &'static str, info: &YtdlpInfo) -> YtdlpError {
    YtdlpError::MissingField {
        field,
        url: info
            .webpage_url()
            .or_else(|| info.media_url())
            .unwrap_or("<unknown>")
            .to_string(),
    }
}
