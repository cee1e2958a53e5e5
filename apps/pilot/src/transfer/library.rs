//! Local screenshot storage, laid out exactly like the object store:
//! `<data_dir>/screenshots/{username}/{epochMillis}.jpg`.

use bytes::Bytes;
use pilot_proto::{normalize_username, ScreenshotKey, SCREENSHOT_DIR};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// A screenshot stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub key: ScreenshotKey,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScreenshotLibrary {
    root: PathBuf,
}

impl ScreenshotLibrary {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(SCREENSHOT_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ScreenshotKey) -> PathBuf {
        self.root.join(key.username()).join(key.file_name())
    }

    /// Returns the capture for `key` if its file exists.
    pub fn capture(&self, key: &ScreenshotKey) -> Option<Capture> {
        let path = self.path_for(key);
        path.is_file().then(|| Capture {
            key: key.clone(),
            path,
        })
    }

    /// Stores a fresh capture. `captured_at` becomes both the file name and the
    /// upload timestamp, so it must be the capture moment.
    pub async fn save_capture(
        &self,
        username: &str,
        captured_at: i64,
        bytes: &[u8],
    ) -> io::Result<Capture> {
        let key = ScreenshotKey::new(username, captured_at);
        let path = self.write_atomic(&key, bytes).await?;
        Ok(Capture { key, path })
    }

    /// Keys stored for `username`, newest first. A missing directory is empty.
    pub fn list_keys(&self, username: &str) -> io::Result<Vec<ScreenshotKey>> {
        let username = normalize_username(username);
        let dir = self.root.join(&username);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = ScreenshotKey::from_file_name(&username, name) {
                keys.push(key);
            }
        }
        keys.sort_by(|a, b| b.captured_at().cmp(&a.captured_at()));
        Ok(keys)
    }

    pub async fn read(&self, key: &ScreenshotKey) -> io::Result<Bytes> {
        tokio::fs::read(self.path_for(key)).await.map(Bytes::from)
    }

    /// Writes through a temporary sibling and renames it into place, so a
    /// crash never leaves a truncated screenshot under its final name.
    pub async fn write_atomic(&self, key: &ScreenshotKey, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = path.with_file_name(format!(".{}.part", key.file_name()));
        tokio::fs::write(&temp, bytes).await?;
        if let Err(err) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err);
        }
        debug!(target: "pilot::transfer", key = %key, bytes = bytes.len(), "capture written");
        Ok(path)
    }

    /// Returns `false` when there was nothing to remove.
    pub async fn remove(&self, key: &ScreenshotKey) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Maps a `PUTNames` entry back to a key. Entries may be a bare file name,
    /// `user/123.jpg`, or a full local path.
    pub fn resolve_put_name(&self, username: &str, name: &str) -> Option<ScreenshotKey> {
        let trimmed = name.trim();
        if trimmed.contains('/') || trimmed.contains('\\') {
            ScreenshotKey::parse(&trimmed.replace('\\', "/"))
        } else {
            ScreenshotKey::from_file_name(username, trimmed)
        }
    }

    /// Derives the key a presigned GET URL points at from its path.
    pub fn key_for_download(&self, username: &str, url: &str) -> Option<ScreenshotKey> {
        let parsed = Url::parse(url).ok()?;
        let path = parsed.path();
        ScreenshotKey::parse(path).or_else(|| {
            let file = path.rsplit('/').next()?;
            ScreenshotKey::from_file_name(username, file)
        })
    }
}
