//! Error types shared across the crate
//!
//! Each seam owns a small typed error enum; the binary edge collapses
//! everything into `anyhow` for reporting.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are fatal at startup: the process refuses to run with a config
/// it cannot fully understand.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config for feed '{feed_id}': {reason}")]
    InvalidFeed { feed_id: String, reason: String },
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database operation failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("feed not found: {feed_id}")]
    FeedNotFound { feed_id: String },

    #[error("download not found: {feed_id}/{download_id}")]
    DownloadNotFound {
        feed_id: String,
        download_id: String,
    },
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DatabaseError::FeedNotFound { .. } | DatabaseError::DownloadNotFound { .. }
        )
    }
}

/// Filesystem failures, carrying the operation and path for diagnostics.
#[derive(Debug, Error)]
#[error("file operation '{operation}' failed for {path}: {source}")]
pub struct FileError {
    pub operation: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl FileError {
    pub fn new(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// ffprobe subprocess failures.
#[derive(Debug, Error)]
pub enum FfprobeError {
    #[error("failed to spawn ffprobe: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffprobe timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("ffprobe exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("ffprobe produced unparseable output: {0}")]
    InvalidOutput(String),
}

/// ffmpeg subprocess failures.
#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffmpeg timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("ffmpeg exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

/// yt-dlp subprocess and metadata-parsing failures.
#[derive(Debug, Error)]
pub enum YtdlpError {
    #[error("yt-dlp binary not found at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to spawn yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("i/o around yt-dlp failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("yt-dlp timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("yt-dlp exited with {code:?}: {stderr_tail}")]
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("yt-dlp emitted invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("yt-dlp metadata is missing required field '{field}' for {url}")]
    MissingField { field: &'static str, url: String },

    /// The site handler decided this entry must not become a download
    /// (e.g. a text-only Patreon post). Callers skip, never fail.
    #[error("entry filtered out: {reason}")]
    FilteredOut { reason: String },

    #[error("unsupported url: {url}")]
    UnsupportedUrl { url: String },

    #[error("no media file produced for {download_id}")]
    NoMediaProduced { download_id: String },
}

impl YtdlpError {
    pub fn is_filtered_out(&self) -> bool {
        matches!(self, YtdlpError::FilteredOut { .. })
    }
}

/// Cover art / thumbnail acquisition failures.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image request failed for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("image fetch via extractor failed: {0}")]
    Extractor(#[from] YtdlpError),

    #[error("no thumbnail available")]
    NotAvailable,

    #[error(transparent)]
    Ffprobe(#[from] FfprobeError),

    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),

    #[error(transparent)]
    File(#[from] FileError),
}

/// A single download's media fetch failed.
#[derive(Debug, Error)]
#[error("download failed for {feed_id}/{download_id}: {source}")]
pub struct DownloadError {
    pub feed_id: String,
    pub download_id: String,
    #[source]
    pub source: YtdlpError,
}

/// The enqueue phase failed for a feed.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("metadata fetch failed for feed '{feed_id}': {source}")]
    Fetch {
        feed_id: String,
        #[source]
        source: YtdlpError,
    },

    #[error("enqueue failed for feed '{feed_id}': {source}")]
    Database {
        feed_id: String,
        #[source]
        source: DatabaseError,
    },
}

/// The prune phase failed for a feed.
#[derive(Debug, Error)]
#[error("prune failed for feed '{feed_id}': {source}")]
pub struct PruneError {
    pub feed_id: String,
    #[source]
    pub source: DatabaseError,
}

/// RSS generation failed for a feed.
#[derive(Debug, Error)]
pub enum RssGenerationError {
    #[error("rss generation failed for feed '{feed_id}': {reason}")]
    Build { feed_id: String, reason: String },

    #[error("rss generation failed for feed '{feed_id}': {source}")]
    Database {
        feed_id: String,
        #[source]
        source: DatabaseError,
    },

    #[error("failed to persist rss for feed '{feed_id}': {source}")]
    Write {
        feed_id: String,
        #[source]
        source: FileError,
    },
}

/// Manual single-URL submission outcomes that are not successes.
#[derive(Debug, Error)]
pub enum ManualSubmissionError {
    #[error("url not supported by the extractor: {url}")]
    UnsupportedUrl { url: String },

    #[error("media at {url} is not yet available: {reason}")]
    Unavailable { url: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A single feed could not be reconciled against configuration.
#[derive(Debug, Error)]
#[error("state reconciliation failed for feed '{feed_id}': {reason}")]
pub struct ReconcileError {
    pub feed_id: String,
    pub reason: String,
}
