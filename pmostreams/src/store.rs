//! Durable stream registry
//!
//! The registry is a pretty-printed JSON array of [`StoredStream`] in display
//! order. Every save goes through a sibling temporary file that is renamed
//! over the registry, so a crash mid-write leaves either the old or the new
//! content on disk.

use crate::error::{Result, StreamError};
use crate::model::StoredStream;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the registry. A missing file is an empty registry.
    pub async fn load(&self) -> Result<Vec<StoredStream>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            StreamError::Persistence(format!("{} is corrupt: {}", self.path.display(), e))
        })
    }

    /// Replaces the registry content atomically.
    pub async fn save(&self, streams: &[StoredStream]) -> Result<()> {
        let json = serde_json::to_vec_pretty(streams)
            .map_err(|e| StreamError::Persistence(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.temp_path();
        if let Err(e) = write_synced(&tmp, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), count = streams.len(), "Stream registry saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Writes `bytes` and flushes them to the device before returning.
async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamStatus;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn stored(id: &str, status: StreamStatus) -> StoredStream {
        StoredStream {
            id: id.to_string(),
            name: id.to_uppercase(),
            device_id: format!("dev-{}", id),
            bitrate: 256,
            status,
            last_error: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = RegistryStore::new(tmp.path().join("registry.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload_keeps_order_and_fields() {
        let tmp = TempDir::new().unwrap();
        let store = RegistryStore::new(tmp.path().join("streams/registry.json"));
        let streams = vec![
            stored("a", StreamStatus::Running),
            stored("b", StreamStatus::Stopped),
            stored("c", StreamStatus::Error),
        ];

        store.save(&streams).await.unwrap();
        assert_eq!(store.load().await.unwrap(), streams);
        assert!(!tmp.path().join("streams/registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");
        std::fs::write(&path, "[{\"id\": ").unwrap();

        let store = RegistryStore::new(&path);
        assert!(matches!(store.load().await, Err(StreamError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_save_overwrites_stale_temp_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");
        std::fs::write(tmp.path().join("registry.json.tmp"), "[{\"id\": \"half").unwrap();

        let store = RegistryStore::new(&path);
        let streams = vec![stored("a", StreamStatus::Running)];
        store.save(&streams).await.unwrap();

        assert_eq!(store.load().await.unwrap(), streams);
        assert!(!tmp.path().join("registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");
        let store = RegistryStore::new(&path);
        let streams = vec![stored("a", StreamStatus::Stopped)];
        store.save(&streams).await.unwrap();

        std::fs::create_dir(tmp.path().join("registry.json.tmp")).unwrap();
        assert!(store.save(&[]).await.is_err());
        assert_eq!(store.load().await.unwrap(), streams);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_content() {
        let tmp = TempDir::new().unwrap();
        let store = RegistryStore::new(tmp.path().join("registry.json"));
        store.save(&[stored("a", StreamStatus::Stopped)]).await.unwrap();
        store.save(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
