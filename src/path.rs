//! On-disk layout and public URL construction
//!
//! Everything the service writes lives under a single data directory:
//!
//! ```text
//! {data_dir}/
//! ├── {feed_id}/
//! │   ├── {download_id}.{ext}             media
//! │   ├── {download_id}.{thumbnail_ext}   thumbnail
//! │   ├── {download_id}.{transcript_ext}  transcript
//! │   └── feed.xml                        generated document
//! └── image/
//!     └── {feed_id}.jpg                   feed cover art
//! ```
//!
//! Identifiers are embedded in paths and URLs verbatim, so they are
//! validated before use; anything that could escape the tree is rejected.

use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::constants::feed::{FEED_XML_FILENAME, IMAGE_DIR};
use crate::constants::INCOMPLETE_SUFFIX;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("identifier must not be empty")]
    Empty,

    #[error("identifier '{0}' contains a path separator or traversal")]
    Unsafe(String),

    #[error("identifier '{0}' must not start with a dot")]
    Hidden(String),
}

/// Computes every path and URL the rest of the system uses.
#[derive(Debug, Clone)]
pub struct PathManager {
    data_dir: PathBuf,
    base_url: Url,
}

impl PathManager {
    pub fn new(data_dir: PathBuf, base_url: Url) -> Self {
        Self { data_dir, base_url }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Reject identifiers that could escape the data tree or collide with
    /// internal files.
    pub fn validate_id(id: &str) -> Result<(), PathError> {
        if id.is_empty() {
            return Err(PathError::Empty);
        }
        if id.starts_with('.') {
            return Err(PathError::Hidden(id.to_string()));
        }
        if id.contains('/') || id.contains('\\') || id.contains("..") || id.contains('\0') {
            return Err(PathError::Unsafe(id.to_string()));
        }
        Ok(())
    }

    pub fn feed_dir(&self, feed_id: &str) -> Result<PathBuf, PathError> {
        Self::validate_id(feed_id)?;
        Ok(self.data_dir.join(feed_id))
    }

    pub fn media_path(
        &self,
        feed_id: &str,
        download_id: &str,
        ext: &str,
    ) -> Result<PathBuf, PathError> {
        Self::validate_id(download_id)?;
        Self::validate_id(ext)?;
        Ok(self.feed_dir(feed_id)?.join(format!("{download_id}.{ext}")))
    }

    pub fn feed_xml_path(&self, feed_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.feed_dir(feed_id)?.join(FEED_XML_FILENAME))
    }

    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join(IMAGE_DIR)
    }

    /// Converted cover art for a feed (always jpg after conversion).
    pub fn feed_image_path(&self, feed_id: &str, ext: &str) -> Result<PathBuf, PathError> {
        Self::validate_id(feed_id)?;
        Self::validate_id(ext)?;
        Ok(self.image_dir().join(format!("{feed_id}.{ext}")))
    }

    /// Sidecar path used while a file is being written.
    pub fn incomplete_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(INCOMPLETE_SUFFIX);
        PathBuf::from(os)
    }

    pub fn media_url(&self, feed_id: &str, download_id: &str, ext: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&format!("media/{feed_id}/{download_id}.{ext}"));
        url.to_string()
    }

    pub fn feed_url(&self, feed_id: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&format!("feeds/{feed_id}.xml"));
        url.to_string()
    }

    pub fn feed_image_url(&self, feed_id: &str, ext: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&format!("media/{feed_id}.{ext}"));
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PathManager {
        PathManager::new(
            PathBuf::from("/data"),
            Url::parse("http://example.com:8024").unwrap(),
        )
    }

    #[test]
    fn media_paths_follow_the_layout() {
        let pm = manager();
        assert_eq!(
            pm.media_path("bbb", "aqz-KE-bpKQ", "mp4").unwrap(),
            PathBuf::from("/data/bbb/aqz-KE-bpKQ.mp4")
        );
        assert_eq!(
            pm.feed_xml_path("bbb").unwrap(),
            PathBuf::from("/data/bbb/feed.xml")
        );
        assert_eq!(
            pm.feed_image_path("bbb", "jpg").unwrap(),
            PathBuf::from("/data/image/bbb.jpg")
        );
    }

    #[test]
    fn urls_are_rooted_at_the_base() {
        let pm = manager();
        assert_eq!(
            pm.media_url("bbb", "aqz-KE-bpKQ", "mp4"),
            "http://example.com:8024/media/bbb/aqz-KE-bpKQ.mp4"
        );
        assert_eq!(pm.feed_url("bbb"), "http://example.com:8024/feeds/bbb.xml");
    }

    #[test]
    fn hostile_identifiers_are_rejected() {
        let pm = manager();
        assert!(pm.feed_dir("../etc").is_err());
        assert!(pm.feed_dir("a/b").is_err());
        assert!(pm.feed_dir("").is_err());
        assert!(pm.feed_dir(".hidden").is_err());
        assert!(pm.media_path("ok", "id", "mp4/../../x").is_err());
    }

    #[test]
    fn incomplete_sidecar_appends_suffix() {
        let path = PathBuf::from("/data/bbb/video.mp4");
        assert_eq!(
            PathManager::incomplete_path(&path),
            PathBuf::from("/data/bbb/video.mp4.incomplete")
        );
    }
}
