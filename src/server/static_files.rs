//! Static serving of generated documents and media
//!
//! Feed documents are read directly (they are small and need an RSS
//! content type); media goes through the filesystem service so Range and
//! conditional requests behave. Incomplete sidecars are never served.

use axum::extract::{Path as UrlPath, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::util::ServiceExt;
use tower_http::services::ServeFile;

use crate::constants::INCOMPLETE_SUFFIX;
use crate::path::PathManager;

use super::AppState;

const RSS_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

/// `GET /feeds/{feed_id}.xml`
pub async fn serve_feed_xml(
    State(state): State<AppState>,
    UrlPath(feed_file): UrlPath<String>,
) -> Response {
    let Some(feed_id) = feed_file.strip_suffix(".xml") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if PathManager::validate_id(feed_id).is_err() {
        return StatusCode::NOT_FOUND.into_response();
    }

    // serve from cache when this process generated the document, else fall
    // back to the file a previous run left behind
    if let Some(bytes) = state.rss.get_feed_xml(feed_id).await {
        return (
            [(header::CONTENT_TYPE, RSS_CONTENT_TYPE)],
            bytes.as_ref().clone(),
        )
            .into_response();
    }

    let Ok(path) = state.files.paths().feed_xml_path(feed_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, RSS_CONTENT_TYPE)], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /media/{feed_id}/{download_id}.{ext}` with Range support.
pub async fn serve_media(
    State(state): State<AppState>,
    UrlPath((feed_id, file_name)): UrlPath<(String, String)>,
    request: Request,
) -> Response {
    if PathManager::validate_id(&feed_id).is_err()
        || PathManager::validate_id(&file_name).is_err()
        || file_name.ends_with(INCOMPLETE_SUFFIX)
    {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Ok(feed_dir) = state.files.paths().feed_dir(&feed_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    serve_file(feed_dir.join(file_name), request).await
}

/// `GET /media/{feed_id}.{ext}`: feed cover art from the image subtree.
pub async fn serve_feed_image(
    State(state): State<AppState>,
    UrlPath(image_file): UrlPath<String>,
    request: Request,
) -> Response {
    if PathManager::validate_id(&image_file).is_err() {
        return StatusCode::NOT_FOUND.into_response();
    }
    serve_file(state.files.paths().image_dir().join(image_file), request).await
}

async fn serve_file(path: std::path::PathBuf, request: Request) -> Response {
    if !path.is_file() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
