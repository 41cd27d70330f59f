//! Application-wide constants
//!
//! This module centralizes magic numbers and defaults used throughout the
//! application, making them easier to maintain and understand.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Network-related constants
pub mod network {
    use super::*;

    /// Default timeout for HTTP requests (image fetch, probes)
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

    /// Maximum number of redirects to follow
    pub const MAX_REDIRECTS: usize = 10;

    /// User agent string for HTTP requests
    pub const USER_AGENT: &str = concat!("anypod/", env!("CARGO_PKG_VERSION"));
}

/// Subprocess-related constants
pub mod subprocess {
    use super::*;

    /// Timeout for yt-dlp metadata enumeration (not media downloads)
    pub const YTDLP_METADATA_TIMEOUT: Duration = Duration::from_secs(300);

    /// Timeout for a single media download
    pub const YTDLP_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Timeout for ffprobe invocations
    pub const FFPROBE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Timeout for ffmpeg image conversions
    pub const FFMPEG_TIMEOUT: Duration = Duration::from_secs(120);

    /// Grace period between SIGTERM and SIGKILL when cancelling
    pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

    /// Tail of subprocess output preserved for diagnostics
    pub const LOG_TAIL_BYTES: usize = 16 * 1024;
}

/// Scheduling constants
pub mod scheduling {
    use super::*;

    /// Default cap on feeds processed concurrently
    pub const DEFAULT_MAX_CONCURRENT_FEEDS: usize = 3;

    /// How often the extractor self-update is allowed to run
    pub const YTDLP_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Cron expression for the daily maintenance job (03:00 UTC)
    pub const MAINTENANCE_SCHEDULE: &str = "0 0 3 * * *";
}

/// Feed and RSS constants
pub mod feed {
    /// Default maximum per-item errors before a download is parked in the
    /// error state
    pub const DEFAULT_MAX_ERRORS: i64 = 3;

    /// Owner email used when a feed config does not provide one
    pub const DEFAULT_AUTHOR_EMAIL: &str = "podcast@example.com";

    /// `<generator>` value stamped into produced documents
    pub const RSS_GENERATOR: &str = concat!("anypod/", env!("CARGO_PKG_VERSION"));

    /// `<ttl>` advertised to podcast clients, in minutes
    pub const RSS_TTL_MINUTES: u32 = 60;

    /// File name of the generated document inside a feed's directory
    pub const FEED_XML_FILENAME: &str = "feed.xml";

    /// Subdirectory of the data dir that holds converted cover art
    pub const IMAGE_DIR: &str = "image";
}

/// Suffix for partially written files; never served, swept at startup
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Sentinel for "this feed has never synced": new feeds without an explicit
/// `since` start from here so the first fetch sees the full history.
pub fn min_sync_date() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
