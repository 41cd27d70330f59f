//! Admin API: feed operations over JSON
//!
//! Every endpoint delegates to a core operation and translates its typed
//! errors into the status-code policy: 404 for missing things, 400 for
//! semantic rejections, 422 for "not available yet", 500 otherwise.

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::db::types::DownloadStatus;
use crate::error::DatabaseError;

use super::{ApiError, AppState};

/// `GET /api/feeds`: ids plus per-feed counters.
pub async fn list_feeds(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let feeds = state.feeds.get_feeds(None).await?;
    let mut entries = Vec::with_capacity(feeds.len());
    for feed in feeds {
        let queued = state
            .downloads
            .count_downloads_by_status(DownloadStatus::Queued, Some(&feed.id))
            .await?;
        let errors = state
            .downloads
            .count_downloads_by_status(DownloadStatus::Error, Some(&feed.id))
            .await?;
        entries.push(json!({
            "id": feed.id,
            "title": feed.display_title(),
            "enabled": feed.is_enabled,
            "total_downloads": feed.total_downloads,
            "queued": queued,
            "errors": errors,
            "last_successful_sync": feed.last_successful_sync.to_rfc3339(),
            "consecutive_failures": feed.consecutive_failures,
        }));
    }
    Ok(Json(json!({ "feeds": entries })))
}

#[derive(Debug, Serialize)]
pub struct ResetErrorsResponse {
    pub feed_id: String,
    pub reset_count: u64,
}

/// `POST /admin/feeds/{id}/reset-errors`: bulk error to queued.
pub async fn reset_errors(
    State(state): State<AppState>,
    UrlPath(feed_id): UrlPath<String>,
) -> Result<Json<ResetErrorsResponse>, ApiError> {
    // 404 before mutating anything
    state.feeds.get_feed_by_id(&feed_id).await?;

    let reset_count = state
        .downloads
        .requeue_downloads(&feed_id, None, Some(DownloadStatus::Error))
        .await
        .map_err(ApiError::from)?;
    info!(feed_id = %feed_id, reset_count, "errors reset to queued");
    Ok(Json(ResetErrorsResponse { feed_id, reset_count }))
}

#[derive(Debug, Deserialize)]
pub struct SubmitDownloadRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitDownloadResponse {
    pub feed_id: String,
    pub download_id: String,
    pub new: bool,
    pub status: DownloadStatus,
    pub message: String,
}

/// `POST /admin/feeds/{id}/downloads`: manual single-URL submission.
pub async fn submit_download(
    State(state): State<AppState>,
    UrlPath(feed_id): UrlPath<String>,
    Json(body): Json<SubmitDownloadRequest>,
) -> Result<Json<SubmitDownloadResponse>, ApiError> {
    let Some(config) = state.feed_configs.get(&feed_id) else {
        return Err(ApiError::NotFound(format!(
            "feed '{feed_id}' is not configured"
        )));
    };
    if !config.enabled {
        return Err(ApiError::BadRequest(format!("feed '{feed_id}' is disabled")));
    }
    if !config.schedule.is_manual() {
        return Err(ApiError::BadRequest(format!(
            "feed '{feed_id}' is not a manual feed"
        )));
    }

    let outcome = state
        .submissions
        .submit(&feed_id, &body.url, state.cookies_path.as_deref())
        .await?;

    let message = if outcome.new {
        // a fresh item means there is work to do; kick the runner
        state.manual_runner.trigger(&feed_id, config).await;
        "download queued".to_string()
    } else {
        format!("already known with status {}", outcome.status)
    };

    Ok(Json(SubmitDownloadResponse {
        feed_id,
        download_id: outcome.download_id,
        new: outcome.new,
        status: outcome.status,
        message,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshMetadataRequest {
    #[serde(default)]
    pub refresh_transcript: bool,
}

#[derive(Debug, Serialize)]
pub struct RefreshMetadataResponse {
    pub feed_id: String,
    pub download_id: String,
    pub changed_fields: Vec<&'static str>,
    pub thumbnail_url_changed: bool,
    pub transcript_metadata_changed: bool,
}

/// `POST /admin/feeds/{id}/downloads/{did}/refresh-metadata`
pub async fn refresh_metadata(
    State(state): State<AppState>,
    UrlPath((feed_id, download_id)): UrlPath<(String, String)>,
    body: Option<Json<RefreshMetadataRequest>>,
) -> Result<Json<RefreshMetadataResponse>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let feed = state.feeds.get_feed_by_id(&feed_id).await?;
    let download = state
        .downloads
        .get_download_by_id(&feed_id, &download_id)
        .await?;

    let user_args = state
        .feed_configs
        .get(&feed_id)
        .map(|c| c.yt_args_vec())
        .unwrap_or_default();
    let (transcript_lang, priority) = if body.refresh_transcript {
        (feed.transcript_lang.clone(), feed.transcript_priority())
    } else {
        (None, Vec::new())
    };

    let outcome = state
        .enqueuer
        .refresh_metadata(
            &download,
            &user_args,
            transcript_lang.as_deref(),
            &priority,
            state.cookies_path.as_deref(),
        )
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(RefreshMetadataResponse {
        feed_id,
        download_id,
        changed_fields: outcome.changed_fields,
        thumbnail_url_changed: outcome.thumbnail_url_changed,
        transcript_metadata_changed: outcome.transcript_metadata_changed,
    }))
}

/// `DELETE /admin/feeds/{id}/downloads/{did}`: archive and remove media.
pub async fn delete_download(
    State(state): State<AppState>,
    UrlPath((feed_id, download_id)): UrlPath<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let download = state
        .downloads
        .get_download_by_id(&feed_id, &download_id)
        .await?;

    if download.status == DownloadStatus::Downloaded {
        let mut exts: Vec<&str> = vec![&download.ext];
        exts.extend(download.thumbnail_ext.as_deref());
        exts.extend(download.transcript_ext.as_deref());
        for ext in exts {
            let path = state
                .files
                .paths()
                .media_path(&feed_id, &download.id, ext)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            state
                .files
                .delete_file(&path)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
    }
    state
        .downloads
        .archive_download(&feed_id, &download_id)
        .await
        .map_err(|e: DatabaseError| ApiError::from(e))?;

    info!(feed_id = %feed_id, download_id = %download_id, "download archived via admin");
    Ok(StatusCode::NO_CONTENT)
}
