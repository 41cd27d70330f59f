//! HTTP surface
//!
//! Three groups of routes: generated feed documents, media files (with
//! Range support), and the admin API. Handlers only ever invoke core
//! operations; nothing here mutates state directly.

mod admin;
mod health;
mod static_files;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use crate::config::FeedConfig;
use crate::db::{DownloadStore, FeedStore};
use crate::error::{DatabaseError, ManualSubmissionError};
use crate::fsutil::FileManager;
use crate::pipeline::Enqueuer;
use crate::rss::RssFeedGenerator;
use crate::schedule::{ManualFeedRunner, ManualSubmissionService};

/// Shared state handed to every handler.
pub struct ServerState {
    pub feeds: FeedStore,
    pub downloads: DownloadStore,
    pub files: FileManager,
    pub rss: Arc<RssFeedGenerator>,
    pub enqueuer: Arc<Enqueuer>,
    pub manual_runner: Arc<ManualFeedRunner>,
    pub submissions: Arc<ManualSubmissionService>,
    pub feed_configs: BTreeMap<String, FeedConfig>,
    pub cookies_path: Option<PathBuf>,
}

pub type AppState = Arc<ServerState>;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/feeds", get(admin::list_feeds))
        .route("/feeds/:feed_file", get(static_files::serve_feed_xml))
        .route("/media/:feed_id/:file_name", get(static_files::serve_media))
        .route("/media/:image_file", get(static_files::serve_feed_image))
        .route(
            "/admin/feeds/:feed_id/reset-errors",
            post(admin::reset_errors),
        )
        .route(
            "/admin/feeds/:feed_id/downloads",
            post(admin::submit_download),
        )
        .route(
            "/admin/feeds/:feed_id/downloads/:download_id/refresh-metadata",
            post(admin::refresh_metadata),
        )
        .route(
            "/admin/feeds/:feed_id/downloads/:download_id",
            delete(admin::delete_download),
        )
        .with_state(state)
}

/// Uniform error type for JSON handlers.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = match &self {
            // internal details stay in the logs, not on the wire
            ApiError::Internal(detail) => {
                error!(detail, "request failed");
                "internal server error".to_string()
            }
            ApiError::NotFound(detail)
            | ApiError::BadRequest(detail)
            | ApiError::Unprocessable(detail) => detail.clone(),
        };
        (self.status(), Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        if e.is_not_found() {
            ApiError::NotFound(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<ManualSubmissionError> for ApiError {
    fn from(e: ManualSubmissionError) -> Self {
        match e {
            ManualSubmissionError::UnsupportedUrl { .. } => ApiError::BadRequest(e.to_string()),
            ManualSubmissionError::Unavailable { .. } => ApiError::Unprocessable(e.to_string()),
            ManualSubmissionError::Database(db) => db.into(),
        }
    }
}
