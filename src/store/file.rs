//! Filesystem-backed key-value store
//!
//! Each collection is a directory under the store root and each key is a
//! `<key>.json` file inside it. Writes go to a temporary file first and are
//! renamed into place so a crash never leaves a half-written record.

use super::KvStore;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const RECORD_EXT: &str = "json";

/// Store rooted at a directory on disk
///
/// A key that cannot be a file name can never have been written, so reads
/// and deletes treat it as absent while writes reject it.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store, creating the root directory if needed
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| {
            AgentError::Persistence(format!("failed to create {}: {}", root.display(), e))
        })?;

        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf> {
        check_segment(collection)?;
        Ok(self.root.join(collection))
    }

    fn record_path(&self, collection: &str, key: &str) -> Result<PathBuf> {
        check_segment(key)?;
        Ok(self
            .collection_path(collection)?
            .join(format!("{}.{}", key, RECORD_EXT)))
    }
}

/// Collection names and keys become path segments
fn check_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment.starts_with('.')
        || segment.contains(&['/', '\\', '\0'][..])
    {
        return Err(AgentError::Persistence(format!(
            "invalid store key: {:?}",
            segment
        )));
    }
    Ok(())
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if check_segment(key).is_err() {
            debug!("Lookup of unstorable key {:?} in {}", key, collection);
            return Ok(None);
        }
        let path = self.record_path(collection, key)?;

        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Persistence(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn put(&self, collection: &str, key: &str, value: &[u8]) -> Result<()> {
        let dir = self.collection_path(collection)?;
        let path = self.record_path(collection, key)?;

        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.{}", key, Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(value).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(AgentError::Persistence(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }

        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        if check_segment(key).is_err() {
            return Ok(());
        }
        let path = self.record_path(collection, key)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Persistence(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let dir = self.collection_path(collection)?;
        let mut keys = Vec::new();

        if !dir.exists() {
            return Ok(keys);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    keys.push(stem.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_collection_created_on_first_put() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path().join("db")).unwrap();

        assert!(store.get("Deployments", "web").await.unwrap().is_none());
        assert!(store.keys("Deployments").await.unwrap().is_empty());

        store.put("Deployments", "web", b"{}").await.unwrap();
        assert!(store.root().join("Deployments").join("web.json").exists());
        assert_eq!(store.get("Deployments", "web").await.unwrap(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path().to_path_buf()).unwrap();

        store.put("Deployments", "web", b"v1").await.unwrap();
        store.put("Deployments", "web", b"v2").await.unwrap();
        store.put("Deployments", "api", b"v1").await.unwrap();
        assert_eq!(store.get("Deployments", "web").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.keys("Deployments").await.unwrap(), vec!["api", "web"]);

        store.delete("Deployments", "web").await.unwrap();
        store.delete("Deployments", "web").await.unwrap();
        assert!(store.get("Deployments", "web").await.unwrap().is_none());
        assert_eq!(store.keys("Deployments").await.unwrap(), vec!["api"]);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let store = FileStore::new(temp.path().to_path_buf()).unwrap();
            store.put("Deployments", "web", b"persisted").await.unwrap();
        }

        let store = FileStore::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(
            store.get("Deployments", "web").await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rejects_path_keys() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path().to_path_buf()).unwrap();

        let err = store.put("Deployments", "../escape", b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(store.put("Deployments", "", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_unstorable_keys_read_as_absent() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path().to_path_buf()).unwrap();

        for key in ["", ".hidden", "a/b", "a\\b"] {
            assert!(store.get("Deployments", key).await.unwrap().is_none());
            store.delete("Deployments", key).await.unwrap();
        }

        // A bad collection name is still an error
        assert!(store.get("../etc", "web").await.is_err());
    }
}
