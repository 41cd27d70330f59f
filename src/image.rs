//! Cover art and thumbnail acquisition
//!
//! Remote images arrive in whatever format the source serves; podcast
//! clients want JPEG. Files are fetched to a temporary sibling, probed,
//! and either promoted as-is (already JPEG) or converted with ffmpeg.
//! Extensions are recorded by callers only after the final placement
//! succeeded.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::constants::network::{HTTP_TIMEOUT, MAX_REDIRECTS, USER_AGENT};
use crate::error::{FileError, ImageError};
use crate::ffmpeg::{Ffmpeg, Ffprobe};
use crate::fsutil::FileManager;
use crate::ytdlp::YtdlpRunner;

/// All locally hosted images are converted to this extension.
pub const IMAGE_EXT: &str = "jpg";

pub struct ImageDownloader {
    client: reqwest::Client,
    files: FileManager,
    ffprobe: Ffprobe,
    ffmpeg: Ffmpeg,
    ytdlp: YtdlpRunner,
}

impl ImageDownloader {
    pub fn new(
        files: FileManager,
        ffprobe: Ffprobe,
        ffmpeg: Ffmpeg,
        ytdlp: YtdlpRunner,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            files,
            ffprobe,
            ffmpeg,
            ytdlp,
        })
    }

    /// Fetch a feed's cover art from a direct image URL into
    /// `image/{feed_id}.jpg`. Returns the recorded extension.
    pub async fn download_feed_image(
        &self,
        feed_id: &str,
        image_url: &str,
    ) -> Result<String, ImageError> {
        let target = self
            .files
            .paths()
            .feed_image_path(feed_id, IMAGE_EXT)
            .map_err(|e| bad_path(e, feed_id))?;
        self.fetch_and_place(image_url, &target).await?;
        Ok(IMAGE_EXT.to_string())
    }

    /// Fetch a feed's cover art by asking the extractor for the source's
    /// thumbnail first (channels and playlists without a configured image).
    pub async fn download_feed_image_from_source(
        &self,
        feed_id: &str,
        source_url: &str,
        user_args: &[String],
        cookies_path: Option<&Path>,
    ) -> Result<String, ImageError> {
        let thumbnail_url = self
            .ytdlp
            .fetch_thumbnail_url(source_url, user_args, cookies_path)
            .await?
            .ok_or(ImageError::NotAvailable)?;
        self.download_feed_image(feed_id, &thumbnail_url).await
    }

    /// Fetch an item thumbnail into `{feed_id}/{download_id}.jpg`.
    pub async fn download_item_thumbnail(
        &self,
        feed_id: &str,
        download_id: &str,
        thumbnail_url: &str,
    ) -> Result<String, ImageError> {
        let target = self
            .files
            .paths()
            .media_path(feed_id, download_id, IMAGE_EXT)
            .map_err(|e| bad_path(e, feed_id))?;
        self.fetch_and_place(thumbnail_url, &target).await?;
        Ok(IMAGE_EXT.to_string())
    }

    async fn fetch_and_place(&self, url: &str, target: &Path) -> Result<(), ImageError> {
        let temp = self.temp_sibling(target);
        self.stream_to_file(url, &temp).await?;

        let result = self.place_probed(&temp, target).await;
        // the temp file is gone on the promote path; ignore leftovers
        let _ = self.files.delete_file(&temp).await;
        result
    }

    async fn stream_to_file(&self, url: &str, path: &Path) -> Result<(), ImageError> {
        let http_err = |source| ImageError::Http {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http_err)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::new("create_dir_all", parent, e))?;
        }
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| FileError::new("create", path, e))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http_err)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FileError::new("write", path, e))?;
        }
        file.sync_all()
            .await
            .map_err(|e| FileError::new("sync", path, e))?;
        Ok(())
    }

    async fn place_probed(&self, temp: &Path, target: &Path) -> Result<(), ImageError> {
        let codec = self.ffprobe.image_codec(temp).await?;
        if Ffprobe::is_jpeg(&codec) {
            debug!(target = %target.display(), "image already jpeg, moving into place");
            self.files.promote(temp, target).await?;
            return Ok(());
        }

        debug!(%codec, target = %target.display(), "converting image to jpeg");
        // ffmpeg picks the encoder from the output extension
        let converted = self.temp_sibling(target).with_extension(IMAGE_EXT);
        self.ffmpeg.convert_to_jpg(temp, &converted).await?;
        let promote_result = self.files.promote(&converted, target).await;
        if promote_result.is_err() {
            let _ = self.files.delete_file(&converted).await;
        }
        promote_result.map_err(ImageError::from)
    }

    fn temp_sibling(&self, target: &Path) -> PathBuf {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!("tmp-{}.imgpart", Uuid::new_v4().simple()))
    }
}

fn bad_path(err: crate::path::PathError, feed_id: &str) -> ImageError {
    ImageError::File(FileError::new(
        "resolve_path",
        feed_id,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()),
    ))
}
