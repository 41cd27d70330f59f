//! Manual feeds: coalesced triggers and single-URL submissions
//!
//! Feeds whose schedule is the literal `manual` token never tick; an admin
//! submits URLs one at a time and then triggers a pipeline run. Triggers
//! coalesce: if a run for the feed is already queued or running, a new
//! trigger is a no-op rather than unbounded queued work.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::FeedGate;
use crate::config::FeedConfig;
use crate::db::types::DownloadStatus;
use crate::db::{DownloadStore, FeedStore};
use crate::error::{DatabaseError, ManualSubmissionError, YtdlpError};
use crate::pipeline::DataCoordinator;
use crate::ytdlp::YtdlpRunner;

/// Runs the pipeline for manual feeds on demand.
pub struct ManualFeedRunner {
    coordinator: Arc<DataCoordinator>,
    gate: Arc<FeedGate>,
    queued: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ManualFeedRunner {
    pub fn new(coordinator: Arc<DataCoordinator>, gate: Arc<FeedGate>) -> Self {
        Self {
            coordinator,
            gate,
            queued: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Kick off a pipeline run for a manual feed.
    ///
    /// Returns `false` when a run is already queued or running and this
    /// trigger coalesced into it.
    pub async fn trigger(&self, feed_id: &str, feed_config: &FeedConfig) -> bool {
        {
            let mut queued = self.queued.lock().await;
            if let Some(handle) = queued.get(feed_id) {
                if !handle.is_finished() {
                    debug!(feed_id, "trigger coalesced into queued run");
                    return false;
                }
                queued.remove(feed_id);
            }
            if self.gate.is_running(feed_id).await {
                debug!(feed_id, "trigger coalesced into running task");
                return false;
            }

            let coordinator = Arc::clone(&self.coordinator);
            let gate = Arc::clone(&self.gate);
            let queued_map = Arc::clone(&self.queued);
            let feed_id_owned = feed_id.to_string();
            let config = feed_config.clone();

            let handle = tokio::spawn(async move {
                let Some(_slot) = gate.acquire(&feed_id_owned).await else {
                    queued_map.lock().await.remove(&feed_id_owned);
                    return;
                };
                // holding a slot now; no longer merely queued
                queued_map.lock().await.remove(&feed_id_owned);
                let results = coordinator.process_feed(&feed_id_owned, &config).await;
                info!(
                    feed_id = %feed_id_owned,
                    overall_success = results.overall_success(),
                    "manual run finished"
                );
            });
            queued.insert(feed_id.to_string(), handle);
        }
        info!(feed_id, "manual run queued");
        true
    }
}

/// What a submission produced.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub download_id: String,
    /// False when the URL resolved to an item the feed already knows
    pub new: bool,
    pub status: DownloadStatus,
}

/// Accepts a single URL for a manual feed and queues it.
pub struct ManualSubmissionService {
    feeds: FeedStore,
    downloads: DownloadStore,
    ytdlp: Arc<YtdlpRunner>,
}

impl ManualSubmissionService {
    pub fn new(feeds: FeedStore, downloads: DownloadStore, ytdlp: Arc<YtdlpRunner>) -> Self {
        Self {
            feeds,
            downloads,
            ytdlp,
        }
    }

    /// Resolve a URL to exactly one queueable item and insert it.
    ///
    /// Outcomes: unsupported URL (the extractor refuses, or the URL is not
    /// a single item), unavailable (no result yet, or still upcoming), or
    /// success with the new or existing row.
    pub async fn submit(
        &self,
        feed_id: &str,
        url: &str,
        cookies_path: Option<&std::path::Path>,
    ) -> Result<SubmissionOutcome, ManualSubmissionError> {
        let feed = self.feeds.get_feed_by_id(feed_id).await?;
        let priority = feed.transcript_priority();
        let results = self
            .ytdlp
            .fetch_single_metadata(
                feed_id,
                url,
                &[],
                feed.transcript_lang.as_deref(),
                &priority,
                cookies_path,
            )
            .await
            .map_err(|e| classify_fetch_error(url, e))?;

        let mut results = results;
        let download = match results.len() {
            0 => {
                return Err(ManualSubmissionError::Unavailable {
                    url: url.to_string(),
                    reason: "extractor returned no entries".to_string(),
                })
            }
            1 => results.remove(0),
            n => {
                return Err(ManualSubmissionError::UnsupportedUrl {
                    url: format!("{url} (resolved to {n} entries, expected one)"),
                })
            }
        };

        if download.status == DownloadStatus::Upcoming {
            return Err(ManualSubmissionError::Unavailable {
                url: url.to_string(),
                reason: "item has not been broadcast yet".to_string(),
            });
        }

        match self.downloads.get_download_by_id(feed_id, &download.id).await {
            Ok(existing) => {
                info!(feed_id, download_id = %existing.id, status = %existing.status, "submission matched existing item");
                Ok(SubmissionOutcome {
                    download_id: existing.id,
                    new: false,
                    status: existing.status,
                })
            }
            Err(DatabaseError::DownloadNotFound { .. }) => {
                let download_id = download.id.clone();
                self.downloads.upsert_download(&download).await?;
                info!(feed_id, download_id = %download_id, "submission queued new item");
                Ok(SubmissionOutcome {
                    download_id,
                    new: true,
                    status: DownloadStatus::Queued,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn classify_fetch_error(url: &str, error: YtdlpError) -> ManualSubmissionError {
    match error {
        YtdlpError::UnsupportedUrl { url } => ManualSubmissionError::UnsupportedUrl { url },
        YtdlpError::NonZeroExit { stderr_tail, .. }
            if stderr_tail.contains("Unsupported URL") || stderr_tail.contains("is not a valid URL") =>
        {
            ManualSubmissionError::UnsupportedUrl {
                url: url.to_string(),
            }
        }
        other => ManualSubmissionError::Unavailable {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractor_refusals_classify_as_unsupported() {
        let err = classify_fetch_error(
            "https://example.com/x",
            YtdlpError::NonZeroExit {
                code: Some(1),
                stderr_tail: "ERROR: Unsupported URL: https://example.com/x".to_string(),
            },
        );
        assert!(matches!(err, ManualSubmissionError::UnsupportedUrl { .. }));
    }

    #[test]
    fn transient_failures_classify_as_unavailable() {
        let err = classify_fetch_error(
            "https://example.com/x",
            YtdlpError::Timeout { seconds: 300 },
        );
        assert!(matches!(err, ManualSubmissionError::Unavailable { .. }));
    }
}
