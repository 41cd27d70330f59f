//! Transcript acquisition
//!
//! YouTube exposes creator subtitles and auto-generated captions as VTT
//! streams; the extractor fetches them without touching the media. "Not
//! available" is an ordinary outcome, never an error.

use std::path::Path;

use regex::Regex;
use tokio::fs;
use tracing::debug;

use crate::constants::subprocess::YTDLP_METADATA_TIMEOUT;
use crate::db::types::TranscriptSource;
use crate::error::YtdlpError;
use crate::fsutil::FileManager;
use crate::ytdlp::YtdlpRunner;

/// Transcripts are stored as WebVTT.
pub const TRANSCRIPT_EXT: &str = "vtt";

pub struct TranscriptDownloader {
    ytdlp: YtdlpRunner,
    files: FileManager,
}

impl TranscriptDownloader {
    pub fn new(ytdlp: YtdlpRunner, files: FileManager) -> Self {
        Self { ytdlp, files }
    }

    /// Fetch a transcript for one video into
    /// `{feed_id}/{download_id}.vtt`.
    ///
    /// Returns `Ok(true)` when a transcript was placed, `Ok(false)` when
    /// the requested language/source is not available. Errors are reserved
    /// for subprocess failures.
    pub async fn download_transcript(
        &self,
        feed_id: &str,
        download_id: &str,
        video_url: &str,
        lang: &str,
        source: TranscriptSource,
        cookies_path: Option<&Path>,
    ) -> Result<bool, YtdlpError> {
        let subs_flag = match source {
            TranscriptSource::Creator => "--write-subs",
            TranscriptSource::Auto => "--write-auto-subs",
            TranscriptSource::NotAvailable => return Ok(false),
        };

        let target_dir = match self.files.ensure_feed_dirs(feed_id).await {
            Ok(dir) => dir,
            Err(e) => {
                return Err(YtdlpError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )))
            }
        };
        let template = target_dir
            .join(format!("{download_id}.%(ext)s"))
            .to_string_lossy()
            .into_owned();

        let mut args: Vec<String> = vec![
            "--skip-download".to_string(),
            subs_flag.to_string(),
            "--sub-langs".to_string(),
            // match regional variants of the requested language
            format!("{lang},{lang}-*"),
            "--sub-format".to_string(),
            "vtt/best".to_string(),
            "--convert-subs".to_string(),
            "vtt".to_string(),
            "--no-warnings".to_string(),
            "-o".to_string(),
            template,
        ];
        if let Some(cookies) = cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args.push(video_url.to_string());

        self.ytdlp.run(&args, YTDLP_METADATA_TIMEOUT).await?;

        let Some(produced) = self.find_produced_vtt(&target_dir, download_id).await? else {
            debug!(feed_id, download_id, lang, %source, "no transcript available");
            return Ok(false);
        };

        let final_path = target_dir.join(format!("{download_id}.{TRANSCRIPT_EXT}"));
        if produced != final_path {
            fs::rename(&produced, &final_path)
                .await
                .map_err(YtdlpError::Io)?;
        }
        Ok(true)
    }

    /// The tool names subtitle files `{id}.{lang}.vtt`; find the first one
    /// it produced for this item.
    async fn find_produced_vtt(
        &self,
        dir: &Path,
        download_id: &str,
    ) -> Result<Option<std::path::PathBuf>, YtdlpError> {
        let pattern = format!(
            "^{}(\\.[A-Za-z0-9-]+)?\\.{}$",
            regex::escape(download_id),
            TRANSCRIPT_EXT
        );
        let matcher = Regex::new(&pattern).map_err(|e| {
            YtdlpError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e.to_string(),
            ))
        })?;

        let mut candidates = Vec::new();
        let mut entries = fs::read_dir(dir).await.map_err(YtdlpError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(YtdlpError::Io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if matcher.is_match(name) {
                candidates.push(entry.path());
            }
        }
        candidates.sort();
        Ok(candidates.into_iter().next())
    }
}
