//! The external media extractor (yt-dlp) as a collaborator
//!
//! All contact with the tool happens here: argument construction, JSON
//! line parsing, media downloads into `.incomplete` sidecars, and the
//! daily self-update. Per-site interpretation of the returned metadata
//! lives in [`handlers`].

pub mod handlers;
pub mod info;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::constants::subprocess::{
    LOG_TAIL_BYTES, YTDLP_DOWNLOAD_TIMEOUT, YTDLP_METADATA_TIMEOUT,
};
use crate::constants::INCOMPLETE_SUFFIX;
use crate::db::types::{Download, DownloadStatus, SourceType, TranscriptSource};
use crate::error::YtdlpError;
use crate::ffmpeg::Ffprobe;
use handlers::SourceHandler;
use info::YtdlpInfo;

/// Everything a feed-level metadata fetch needs to know.
#[derive(Debug, Clone)]
pub struct MetadataFetchRequest<'a> {
    pub feed_id: &'a str,
    pub source_type: SourceType,
    pub source_url: &'a str,
    pub resolved_url: &'a str,
    pub user_args: &'a [String],
    /// Honored at day granularity for playlist-like sources; ignored for
    /// single videos (the extractor's date precision is coarser than one
    /// entry).
    pub fetch_since: Option<DateTime<Utc>>,
    pub fetch_until: Option<DateTime<Utc>>,
    pub keep_last: Option<i64>,
    pub transcript_lang: Option<&'a str>,
    pub transcript_priority: &'a [TranscriptSource],
    pub cookies_path: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct YtdlpRunner {
    binary: PathBuf,
    ffprobe: Ffprobe,
}

impl YtdlpRunner {
    pub fn new(binary: impl Into<PathBuf>, ffprobe: Ffprobe) -> Self {
        Self {
            binary: binary.into(),
            ffprobe,
        }
    }

    /// Classify a URL and resolve the canonical location to query.
    pub fn determine_fetch_strategy(
        &self,
        feed_id: &str,
        source_url: &str,
    ) -> Result<(String, SourceType), YtdlpError> {
        let (resolved, source_type) = SourceHandler::determine_fetch_strategy(source_url)?;
        debug!(feed_id, %source_type, resolved_url = %resolved, "fetch strategy determined");
        Ok((resolved, source_type))
    }

    /// Enumerate new items for a feed.
    ///
    /// Returned downloads are pre-classified as upcoming or queued. Entries
    /// the site handler filters out are dropped here, not surfaced as
    /// errors.
    pub async fn fetch_new_downloads_metadata(
        &self,
        request: &MetadataFetchRequest<'_>,
    ) -> Result<Vec<Download>, YtdlpError> {
        let args = build_metadata_args(request);
        let (infos, _) = self.execute_json_lines(&args, YTDLP_METADATA_TIMEOUT).await?;

        let handler = SourceHandler::for_url(request.source_url);
        let mut downloads = Vec::with_capacity(infos.len());
        for info in &infos {
            match handler.parse_download(
                request.feed_id,
                info,
                request.transcript_lang,
                request.transcript_priority,
            ) {
                Ok(mut download) => {
                    self.fill_missing_duration(&mut download, info).await;
                    downloads.push(download);
                }
                Err(e) if e.is_filtered_out() => {
                    debug!(feed_id = request.feed_id, %e, "entry filtered out");
                }
                Err(e) => {
                    warn!(feed_id = request.feed_id, %e, "skipping unparseable entry");
                }
            }
        }

        // client-side backstop for sources where the extractor could not
        // apply the cap itself
        if let Some(keep_last) = request.keep_last {
            if keep_last > 0 && downloads.len() > keep_last as usize {
                downloads.sort_by(|a, b| {
                    b.published.cmp(&a.published).then(b.id.cmp(&a.id))
                });
                downloads.truncate(keep_last as usize);
            }
        }
        Ok(downloads)
    }

    /// Fetch metadata for exactly one URL, with no date or count filters.
    ///
    /// Used for upcoming re-polls and manual submissions. Zero or multiple
    /// results are returned as-is; callers decide what ambiguity means.
    pub async fn fetch_single_metadata(
        &self,
        feed_id: &str,
        url: &str,
        user_args: &[String],
        transcript_lang: Option<&str>,
        transcript_priority: &[TranscriptSource],
        cookies_path: Option<&Path>,
    ) -> Result<Vec<Download>, YtdlpError> {
        let request = MetadataFetchRequest {
            feed_id,
            source_type: SourceType::SingleVideo,
            source_url: url,
            resolved_url: url,
            user_args,
            fetch_since: None,
            fetch_until: None,
            keep_last: None,
            transcript_lang,
            transcript_priority,
            cookies_path,
        };
        self.fetch_new_downloads_metadata(&request).await
    }

    /// Fetch the remote thumbnail URL for a source (first entry for
    /// playlist-like sources).
    pub async fn fetch_thumbnail_url(
        &self,
        url: &str,
        user_args: &[String],
        cookies_path: Option<&Path>,
    ) -> Result<Option<String>, YtdlpError> {
        let mut args: Vec<String> = user_args.to_vec();
        args.extend(
            [
                "--skip-download",
                "--dump-json",
                "--no-warnings",
                "--playlist-items",
                "1",
            ]
            .map(str::to_string),
        );
        if let Some(cookies) = cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args.push(url.to_string());

        let (infos, _) = self.execute_json_lines(&args, YTDLP_METADATA_TIMEOUT).await?;
        Ok(infos
            .iter()
            .find_map(|info| info.thumbnail().map(str::to_string)))
    }

    /// Download a single item's media into `target_dir`.
    ///
    /// The tool writes into a `.incomplete` sidecar; on success the file is
    /// renamed into place and the final path returned. On failure the
    /// error carries the stderr tail for the download log.
    pub async fn download_media_to_file(
        &self,
        download: &Download,
        user_args: &[String],
        target_dir: &Path,
        cookies_path: Option<&Path>,
    ) -> Result<PathBuf, YtdlpError> {
        let template = target_dir
            .join(format!("{}.%(ext)s{INCOMPLETE_SUFFIX}", download.id))
            .to_string_lossy()
            .into_owned();

        let mut args: Vec<String> = user_args.to_vec();
        args.extend(["--no-warnings", "--no-progress", "-o"].map(str::to_string));
        args.push(template);
        if let Some(cookies) = cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args.push(download.source_url.clone());

        self.run_to_completion(&args, YTDLP_DOWNLOAD_TIMEOUT).await?;

        let produced = self
            .collect_incomplete_files(target_dir, &download.id)
            .await?;
        if produced.is_empty() {
            return Err(YtdlpError::NoMediaProduced {
                download_id: download.id.clone(),
            });
        }

        let mut final_path: Option<PathBuf> = None;
        for incomplete in produced {
            let file_name = incomplete
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let final_name = file_name.trim_end_matches(INCOMPLETE_SUFFIX);
            let target = target_dir.join(final_name);
            tokio::fs::rename(&incomplete, &target)
                .await
                .map_err(YtdlpError::Io)?;

            let matches_expected_ext = target
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == download.ext);
            if final_path.is_none() || matches_expected_ext {
                final_path = Some(target);
            }
        }
        final_path.ok_or_else(|| YtdlpError::NoMediaProduced {
            download_id: download.id.clone(),
        })
    }

    /// `yt-dlp -U`; invoked by the maintenance job at most once a day.
    pub async fn self_update(&self) -> Result<(), YtdlpError> {
        let args = vec!["-U".to_string()];
        self.run_to_completion(&args, YTDLP_METADATA_TIMEOUT).await?;
        Ok(())
    }

    /// Run the tool with caller-built arguments (transcript fetches and
    /// other sidecar jobs that share the subprocess plumbing).
    pub(crate) async fn run(
        &self,
        args: &[String],
        time_limit: std::time::Duration,
    ) -> Result<String, YtdlpError> {
        self.run_to_completion(args, time_limit).await
    }

    async fn fill_missing_duration(&self, download: &mut Download, info: &YtdlpInfo) {
        if download.duration > 0 || download.status != DownloadStatus::Queued {
            return;
        }
        let Some(media_url) = info.media_url() else {
            return;
        };
        match self.ffprobe.media_duration(media_url).await {
            Ok(seconds) => download.duration = seconds.round() as i64,
            Err(e) => debug!(
                feed_id = %download.feed_id,
                download_id = %download.id,
                %e,
                "duration probe failed"
            ),
        }
    }

    async fn collect_incomplete_files(
        &self,
        dir: &Path,
        download_id: &str,
    ) -> Result<Vec<PathBuf>, YtdlpError> {
        let prefix = format!("{download_id}.");
        let mut produced = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(YtdlpError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(YtdlpError::Io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(INCOMPLETE_SUFFIX) {
                produced.push(entry.path());
            }
        }
        produced.sort();
        Ok(produced)
    }

    async fn execute_json_lines(
        &self,
        args: &[String],
        time_limit: std::time::Duration,
    ) -> Result<(Vec<YtdlpInfo>, String), YtdlpError> {
        let stdout = self.run_to_completion(args, time_limit).await?;
        let mut infos = Vec::new();
        for line in stdout.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || !trimmed.starts_with('{') {
                continue;
            }
            infos.push(YtdlpInfo::parse(trimmed).map_err(YtdlpError::InvalidJson)?);
        }
        Ok((infos, stdout))
    }

    async fn run_to_completion(
        &self,
        args: &[String],
        time_limit: std::time::Duration,
    ) -> Result<String, YtdlpError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                YtdlpError::NotFound {
                    path: self.binary.clone(),
                }
            } else {
                YtdlpError::Spawn(e)
            }
        })?;

        let output = timeout(time_limit, child.wait_with_output())
            .await
            .map_err(|_| YtdlpError::Timeout {
                seconds: time_limit.as_secs(),
            })?
            .map_err(YtdlpError::Spawn)?;

        if !output.status.success() {
            return Err(YtdlpError::NonZeroExit {
                code: output.status.code(),
                stderr_tail: tail_lossy(&output.stderr, LOG_TAIL_BYTES),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Keep only the trailing `max_bytes` of subprocess output, on a char
/// boundary.
pub fn tail_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return text.trim().to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim().to_string()
}

/// System-injected flags plus user pass-through for a metadata fetch.
fn build_metadata_args(request: &MetadataFetchRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = request.user_args.to_vec();
    args.extend(
        ["--skip-download", "--dump-json", "--no-warnings", "--ignore-errors"]
            .map(str::to_string),
    );

    let playlist_like = matches!(
        request.source_type,
        SourceType::Channel | SourceType::Playlist | SourceType::Unknown
    );
    if playlist_like {
        if let Some(since) = request.fetch_since {
            args.push("--dateafter".to_string());
            args.push(since.format("%Y%m%d").to_string());
        }
        if let Some(until) = request.fetch_until {
            args.push("--datebefore".to_string());
            args.push(until.format("%Y%m%d").to_string());
        }
        if let Some(keep_last) = request.keep_last.filter(|n| *n > 0) {
            args.push("--playlist-end".to_string());
            args.push(keep_last.to_string());
        }
    }

    if let Some(cookies) = request.cookies_path {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }

    args.push(request.resolved_url.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request<'a>(
        source_type: SourceType,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        keep_last: Option<i64>,
        user_args: &'a [String],
    ) -> MetadataFetchRequest<'a> {
        MetadataFetchRequest {
            feed_id: "f",
            source_type,
            source_url: "https://www.youtube.com/@chan",
            resolved_url: "https://www.youtube.com/@chan/videos",
            user_args,
            fetch_since: since,
            fetch_until: until,
            keep_last,
            transcript_lang: None,
            transcript_priority: &[],
            cookies_path: None,
        }
    }

    #[test]
    fn channel_fetch_carries_day_granular_date_filters() {
        let since = Utc.with_ymd_and_hms(2024, 6, 1, 13, 45, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 6, 15, 2, 0, 0).unwrap();
        let args = build_metadata_args(&request(
            SourceType::Channel,
            Some(since),
            Some(until),
            Some(10),
            &[],
        ));
        let joined = args.join(" ");
        assert!(joined.contains("--dateafter 20240601"));
        assert!(joined.contains("--datebefore 20240615"));
        assert!(joined.contains("--playlist-end 10"));
        assert!(args.last().unwrap().ends_with("/videos"));
    }

    #[test]
    fn single_video_fetch_ignores_date_filters() {
        let since = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let args = build_metadata_args(&request(
            SourceType::SingleVideo,
            Some(since),
            None,
            Some(5),
            &[],
        ));
        let joined = args.join(" ");
        assert!(!joined.contains("--dateafter"));
        assert!(!joined.contains("--playlist-end"));
    }

    #[test]
    fn user_args_come_first() {
        let user = vec!["--format".to_string(), "bestaudio".to_string()];
        let args = build_metadata_args(&request(SourceType::Channel, None, None, None, &user));
        assert_eq!(&args[..2], &["--format", "bestaudio"]);
        assert!(args.contains(&"--dump-json".to_string()));
    }

    #[test]
    fn tail_keeps_the_end() {
        let text = "0123456789".repeat(10);
        let tail = tail_lossy(text.as_bytes(), 10);
        assert_eq!(tail, "0123456789");
        assert_eq!(tail_lossy(b"short", 100), "short");
    }
}
