//! Application and per-feed configuration
//!
//! Feeds are declared in a YAML file (`feeds:` map keyed by feed id);
//! process-level settings come from environment variables and CLI flags.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::constants;
use crate::cron::CronExpression;
use crate::db::types::{PodcastType, TranscriptSource};
use crate::error::ConfigError;

/// Process-level settings assembled from env vars, CLI flags and defaults.
#[derive(Debug, Clone)]
pub struct AppSettings {
    /// Path to the YAML feeds file (`CONFIG_FILE`)
    pub config_file: PathBuf,
    /// Async store URL (`DATABASE_URL`), e.g. `sqlite:///data/anypod.db?mode=rwc`
    pub database_url: String,
    /// Absolute base for enclosure/media URLs (`BASE_URL`)
    pub base_url: Url,
    /// Root of the on-disk media tree (`BASE_DATA_DIR`)
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Cap on feeds processed concurrently
    pub max_concurrent_feeds: usize,
    /// Optional cookies file handed to the extractor
    pub cookies_path: Option<PathBuf>,
    /// External tool locations (`YTDLP_PATH`, `FFMPEG_PATH`, `FFPROBE_PATH`)
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl AppSettings {
    /// Resolve settings from the environment, falling back to defaults.
    ///
    /// `~` is expanded in all path-valued settings.
    pub fn from_env() -> anyhow::Result<Self> {
        let config_file = expand_path(
            &std::env::var("CONFIG_FILE").unwrap_or_else(|_| "/config/feeds.yaml".to_string()),
        );
        let data_dir = match std::env::var("BASE_DATA_DIR") {
            Ok(dir) => expand_path(&dir),
            Err(_) => default_data_dir()?,
        };
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}?mode=rwc", data_dir.join("anypod.db").display())
        });
        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8024".to_string())
            .parse::<Url>()?;
        let cookies_path = std::env::var("COOKIES_PATH").ok().map(|p| expand_path(&p));

        Ok(Self {
            config_file,
            database_url,
            base_url,
            data_dir,
            bind_addr: ([0, 0, 0, 0], 8024).into(),
            max_concurrent_feeds: constants::scheduling::DEFAULT_MAX_CONCURRENT_FEEDS,
            cookies_path,
            ytdlp_path: tool_path("YTDLP_PATH", "yt-dlp"),
            ffmpeg_path: tool_path("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: tool_path("FFPROBE_PATH", "ffprobe"),
        })
    }
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("", "", "anypod")
        .ok_or_else(|| anyhow::anyhow!("unable to determine application data directory"))?;
    Ok(project_dirs.data_dir().to_path_buf())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn tool_path(env_var: &str, default: &str) -> PathBuf {
    std::env::var(env_var)
        .map(|p| expand_path(&p))
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Top-level shape of the YAML config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedsFile {
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedConfig>,
}

impl FeedsFile {
    /// Load and validate the feeds file.
    ///
    /// Any invalid feed aborts the load; a process running with a config it
    /// only partially understood would silently drop feeds.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: FeedsFile =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        for (feed_id, feed) in &parsed.feeds {
            // ids end up in paths and URLs verbatim
            crate::path::PathManager::validate_id(feed_id).map_err(|e| {
                ConfigError::InvalidFeed {
                    feed_id: feed_id.clone(),
                    reason: e.to_string(),
                }
            })?;
            feed.validate(feed_id)?;
        }
        Ok(parsed)
    }
}

/// How a feed is driven: on a cron schedule, or only by manual submissions.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSchedule {
    Cron(CronExpression),
    Manual,
}

impl FeedSchedule {
    pub fn is_manual(&self) -> bool {
        matches!(self, FeedSchedule::Manual)
    }

    pub fn as_cron(&self) -> Option<&CronExpression> {
        match self {
            FeedSchedule::Cron(expr) => Some(expr),
            FeedSchedule::Manual => None,
        }
    }
}

impl Serialize for FeedSchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FeedSchedule::Manual => serializer.serialize_str("manual"),
            FeedSchedule::Cron(expr) => serializer.serialize_str(expr.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for FeedSchedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim() == "manual" {
            return Ok(FeedSchedule::Manual);
        }
        CronExpression::parse(&raw)
            .map(FeedSchedule::Cron)
            .map_err(serde::de::Error::custom)
    }
}

/// Extractor arguments: either one shell-ish string or an explicit list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum YtArgs {
    Line(String),
    List(Vec<String>),
}

impl YtArgs {
    /// Flatten into an argument vector for the subprocess.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            YtArgs::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            YtArgs::List(list) => list.clone(),
        }
    }
}

/// One configured feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// Source URL; `null` makes this a manual-only feed
    #[serde(default)]
    pub url: Option<String>,
    pub schedule: FeedSchedule,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keep_last: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_since")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_max_errors")]
    pub max_errors: i64,
    #[serde(default)]
    pub yt_args: Option<YtArgs>,
    #[serde(default)]
    pub metadata: Option<FeedMetadataOverrides>,
    #[serde(default)]
    pub transcript_lang: Option<String>,
    #[serde(default)]
    pub transcript_source_priority: Option<Vec<TranscriptSource>>,
}

impl FeedConfig {
    fn validate(&self, feed_id: &str) -> Result<(), ConfigError> {
        if self.url.is_none() && !self.schedule.is_manual() {
            return Err(ConfigError::InvalidFeed {
                feed_id: feed_id.to_string(),
                reason: "feed without a url must use schedule: manual".to_string(),
            });
        }
        if let Some(keep_last) = self.keep_last {
            if keep_last < 0 {
                return Err(ConfigError::InvalidFeed {
                    feed_id: feed_id.to_string(),
                    reason: format!("keep_last must not be negative (got {keep_last})"),
                });
            }
        }
        if self.max_errors < 1 {
            return Err(ConfigError::InvalidFeed {
                feed_id: feed_id.to_string(),
                reason: format!("max_errors must be at least 1 (got {})", self.max_errors),
            });
        }
        if let Some(priority) = &self.transcript_source_priority {
            if priority.contains(&TranscriptSource::NotAvailable) {
                return Err(ConfigError::InvalidFeed {
                    feed_id: feed_id.to_string(),
                    reason: "transcript_source_priority only accepts creator/auto".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Extractor arguments as a plain vector (empty when unset).
    pub fn yt_args_vec(&self) -> Vec<String> {
        self.yt_args.as_ref().map(YtArgs::to_vec).unwrap_or_default()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_errors() -> i64 {
    constants::feed::DEFAULT_MAX_ERRORS
}

/// Accept `since` as either a bare date (midnight UTC) or a full datetime.
fn deserialize_since<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else { return Ok(None) };
    if let Ok(dt) = raw.parse::<DateTime<Utc>>() {
        return Ok(Some(dt));
    }
    if let Ok(date) = raw.parse::<NaiveDate>() {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| serde::de::Error::custom("invalid date"))?;
        return Ok(Some(DateTime::from_naive_utc_and_offset(midnight, Utc)));
    }
    Err(serde::de::Error::custom(format!(
        "unrecognized date value: {raw}"
    )))
}

/// Per-feed overrides for the podcast channel metadata.
///
/// Unset fields never overwrite values derived from the source, so a feed
/// can override just its title or just its category.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FeedMetadataOverrides {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub podcast_type: Option<PodcastType>,
    #[serde(default)]
    pub explicit: Option<bool>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse_feeds(yaml: &str) -> FeedsFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_minimal_feed() {
        let file = parse_feeds(
            r#"
feeds:
  bbb:
    url: "https://youtu.be/aqz-KE-bpKQ"
    schedule: "0 * * * *"
"#,
        );
        let feed = &file.feeds["bbb"];
        assert!(feed.enabled);
        assert_eq!(feed.max_errors, 3);
        assert!(feed.keep_last.is_none());
        assert!(matches!(feed.schedule, FeedSchedule::Cron(_)));
    }

    #[test]
    fn parses_manual_schedule() {
        let file = parse_feeds(
            r#"
feeds:
  inbox:
    schedule: manual
"#,
        );
        assert!(file.feeds["inbox"].schedule.is_manual());
        assert!(file.feeds["inbox"].url.is_none());
    }

    #[test]
    fn missing_url_requires_manual_schedule() {
        let file = parse_feeds(
            r#"
feeds:
  broken:
    schedule: "@hourly"
"#,
        );
        let err = file.feeds["broken"].validate("broken").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeed { .. }));
    }

    #[test]
    fn since_accepts_bare_dates_and_datetimes() {
        let file = parse_feeds(
            r#"
feeds:
  a:
    url: "https://example.com/a"
    schedule: "@daily"
    since: "2024-07-15"
  b:
    url: "https://example.com/b"
    schedule: "@daily"
    since: "2024-07-15T06:30:00Z"
"#,
        );
        assert_eq!(
            file.feeds["a"].since.unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            file.feeds["b"].since.unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 15, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn yt_args_accepts_string_or_list() {
        let file = parse_feeds(
            r#"
feeds:
  a:
    url: "https://example.com/a"
    schedule: "@daily"
    yt_args: "--format bestaudio --no-playlist"
  b:
    url: "https://example.com/b"
    schedule: "@daily"
    yt_args: ["--format", "bestaudio"]
"#,
        );
        assert_eq!(
            file.feeds["a"].yt_args_vec(),
            vec!["--format", "bestaudio", "--no-playlist"]
        );
        assert_eq!(file.feeds["b"].yt_args_vec(), vec!["--format", "bestaudio"]);
    }

    #[test]
    fn metadata_overrides_default_to_unset() {
        let file = parse_feeds(
            r#"
feeds:
  a:
    url: "https://example.com/a"
    schedule: "@daily"
    metadata:
      title: "My Show"
      explicit: true
"#,
        );
        let meta = file.feeds["a"].metadata.as_ref().unwrap();
        assert_eq!(meta.title.as_deref(), Some("My Show"));
        assert_eq!(meta.explicit, Some(true));
        assert!(meta.author.is_none());
        assert!(meta.podcast_type.is_none());
    }
}
