//! File management for the media tree
//!
//! All writes go through a temp-then-rename dance so readers (the HTTP
//! layer) only ever observe complete files. Deletion treats an already
//! missing file as success: the database row, not the filesystem, is the
//! source of truth for what should exist.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::constants::INCOMPLETE_SUFFIX;
use crate::error::FileError;
use crate::path::PathManager;

#[derive(Debug, Clone)]
pub struct FileManager {
    paths: PathManager,
}

impl FileManager {
    pub fn new(paths: PathManager) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &PathManager {
        &self.paths
    }

    /// Create the directory tree for a feed (media dir + shared image dir).
    pub async fn ensure_feed_dirs(&self, feed_id: &str) -> Result<PathBuf, FileError> {
        let feed_dir = self
            .paths
            .feed_dir(feed_id)
            .map_err(|e| invalid_input("feed_dir", self.paths.data_dir(), e))?;
        fs::create_dir_all(&feed_dir)
            .await
            .map_err(|e| FileError::new("create_dir_all", &feed_dir, e))?;
        let image_dir = self.paths.image_dir();
        fs::create_dir_all(&image_dir)
            .await
            .map_err(|e| FileError::new("create_dir_all", &image_dir, e))?;
        Ok(feed_dir)
    }

    /// Write a complete file atomically via a temporary sibling.
    pub async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<(), FileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::new("create_dir_all", parent, e))?;
        }

        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| FileError::new("create", &tmp, e))?;
        file.write_all(content)
            .await
            .map_err(|e| FileError::new("write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| FileError::new("sync", &tmp, e))?;
        drop(file);

        fs::rename(&tmp, path)
            .await
            .map_err(|e| FileError::new("rename", path, e))
    }

    /// Move a fully-written file into its final place (same filesystem).
    pub async fn promote(&self, from: &Path, to: &Path) -> Result<(), FileError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::new("create_dir_all", parent, e))?;
        }
        fs::rename(from, to)
            .await
            .map_err(|e| FileError::new("rename", to, e))
    }

    /// Delete a file if present. Returns whether anything was removed.
    pub async fn delete_file(&self, path: &Path) -> Result<bool, FileError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FileError::new("remove_file", path, e)),
        }
    }

    pub async fn file_size(&self, path: &Path) -> Result<Option<u64>, FileError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileError::new("metadata", path, e)),
        }
    }

    /// Remove `*.incomplete` sidecars left behind by a previous crash.
    ///
    /// Only scans one level of feed directories; the tree is flat.
    pub async fn sweep_incomplete(&self) -> Result<usize, FileError> {
        let root = self.paths.data_dir().to_path_buf();
        if !root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut dirs = fs::read_dir(&root)
            .await
            .map_err(|e| FileError::new("read_dir", &root, e))?;
        while let Some(entry) = dirs
            .next_entry()
            .await
            .map_err(|e| FileError::new("read_dir", &root, e))?
        {
            let dir_path = entry.path();
            if !dir_path.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(&dir_path)
                .await
                .map_err(|e| FileError::new("read_dir", &dir_path, e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| FileError::new("read_dir", &dir_path, e))?
            {
                let path = file.path();
                let is_incomplete = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(INCOMPLETE_SUFFIX));
                if is_incomplete && self.delete_file(&path).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn invalid_input(
    operation: &'static str,
    path: &Path,
    err: crate::path::PathError,
) -> FileError {
    FileError::new(
        operation,
        path,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use url::Url;

    fn manager(dir: &TempDir) -> FileManager {
        FileManager::new(PathManager::new(
            dir.path().to_path_buf(),
            Url::parse("http://localhost:8024").unwrap(),
        ))
    }

    #[tokio::test]
    async fn atomic_write_creates_parents_and_content() {
        let dir = TempDir::new().unwrap();
        let fm = manager(&dir);
        let path = dir.path().join("feed").join("item.mp4");

        fm.atomic_write(&path, b"media bytes").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"media bytes");
        assert_eq!(fm.file_size(&path).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fm = manager(&dir);
        let path = dir.path().join("gone.mp4");

        assert!(!fm.delete_file(&path).await.unwrap());
        fm.atomic_write(&path, b"x").await.unwrap();
        assert!(fm.delete_file(&path).await.unwrap());
        assert!(!fm.delete_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_only_incomplete_sidecars() {
        let dir = TempDir::new().unwrap();
        let fm = manager(&dir);
        let feed_dir = dir.path().join("bbb");
        fs::create_dir_all(&feed_dir).await.unwrap();
        fs::write(feed_dir.join("keep.mp4"), b"x").await.unwrap();
        fs::write(feed_dir.join("partial.mp4.incomplete"), b"x")
            .await
            .unwrap();

        let removed = fm.sweep_incomplete().await.unwrap();
        assert_eq!(removed, 1);
        assert!(feed_dir.join("keep.mp4").exists());
        assert!(!feed_dir.join("partial.mp4.incomplete").exists());
    }
}
