//! Object store for inbound artifacts.
//!
//! Artifacts are written once under a generated key
//! (`<artisan>/<timestamp_ms>_<batch>_<index>.<ext>`) and addressed afterwards by the
//! public URL returned from [`ObjectStore::put`].

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

/// Blob storage keyed by relative path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path` and return the public URL.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str)
    -> Result<String, StorageError>;

    /// Remove the object at `path`.
    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Read an object back by its URL.
    async fn get(&self, url: &str) -> Result<Vec<u8>, StorageError>;

    /// Map a URL returned by `put` back to its storage path.
    fn path_for_url(&self, url: &str) -> Option<String>;
}

/// Names one ingestion. Every artifact of a message shares it, and two
/// messages never do, even within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionKey {
    pub timestamp_ms: i64,
    pub batch: Uuid,
}

impl IngestionKey {
    pub fn now() -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            batch: Uuid::new_v4(),
        }
    }
}

/// Build the storage key for the `index`-th artifact of one ingestion.
pub fn artifact_path(artisan_id: Uuid, key: IngestionKey, index: usize, extension: &str) -> String {
    format!(
        "{artisan_id}/{}_{}_{index}.{extension}",
        key.timestamp_ms,
        key.batch.simple()
    )
}

/// Pick a file extension from the file name, else the MIME type, else `bin`.
pub fn extension_for(file_name: Option<&str>, mime: Option<&str>) -> String {
    file_name
        .and_then(extension_from_name)
        .or_else(|| mime.and_then(extension_from_mime).map(str::to_string))
        .unwrap_or_else(|| "bin".to_string())
}

fn extension_from_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn extension_from_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        "application/pdf" => "pdf",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/webm" => "webm",
        "audio/aac" => "aac",
        "text/plain" => "txt",
        _ => return None,
    };
    Some(ext)
}

/// Filesystem-backed object store served under a public base URL.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
    http: reqwest::Client,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, fetch_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative key under the root, refusing anything that escapes it.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let full = self.resolve(path)?;
        let write_err = |e: std::io::Error| StorageError::Write {
            path: path.to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
            .map_err(write_err)?;
        file.write_all(&bytes).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;

        debug!(path, content_type, size = bytes.len(), "Artifact stored");
        Ok(format!("{}/{path}", self.public_base_url))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| StorageError::Remove {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(path) = self.path_for_url(url) {
            let full = self.resolve(&path)?;
            return tokio::fs::read(&full).await.map_err(|e| StorageError::Read {
                url: url.to_string(),
                reason: e.to_string(),
            });
        }

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StorageError::InvalidPath(url.to_string()));
        }

        let read_err = |reason: String| StorageError::Read {
            url: url.to_string(),
            reason,
        };
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| read_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(read_err(format!("HTTP {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(|e| read_err(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn path_for_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.public_base_url)?
            .strip_prefix('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}
