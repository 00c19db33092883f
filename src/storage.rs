//! Physical file store
//!
//! Files live under `<root>/<beam id % 1000>/<file id>-<flattened name>`.
//! Shard directories are created on first use.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{BeamlineError, Result};

/// File that must exist in the store root before anything is purged.
pub const SENTINEL: &str = ".test";

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, storage_name: &str) -> PathBuf {
        self.root.join(storage_name)
    }

    /// Create (or truncate) the file behind `storage_name`.
    pub async fn create(&self, storage_name: &str) -> Result<File> {
        let path = self.path_of(storage_name);
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard).await.map_err(|e| {
                BeamlineError::Storage(format!("Cannot create {}: {}", shard.display(), e))
            })?;
        }
        File::create(&path)
            .await
            .map_err(|e| BeamlineError::Storage(format!("Cannot create {}: {}", path.display(), e)))
    }

    /// Remove a stored file. Returns false if it was already gone.
    pub async fn remove(&self, storage_name: &str) -> Result<bool> {
        let path = self.path_of(storage_name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BeamlineError::Storage(format!(
                "Cannot delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// On-disk size, or `None` when the file does not exist.
    pub async fn size_of(&self, storage_name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_of(storage_name)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the store is actually mounted.
    pub async fn probe(&self) -> Result<()> {
        let sentinel = self.root.join(SENTINEL);
        fs::metadata(&sentinel).await.map(|_| ()).map_err(|e| {
            BeamlineError::Storage(format!(
                "Storage sentinel {} is not accessible: {}",
                sentinel.display(),
                e
            ))
        })
    }

    /// Create the sentinel file; part of provisioning a new store.
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::write(self.root.join(SENTINEL), b"").await?;
        info!("Initialized storage at {}", self.root.display());
        Ok(())
    }

    /// Storage names of every file currently on disk, sentinel excluded.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| BeamlineError::Storage(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if relative == Path::new(SENTINEL) {
                continue;
            }
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Hex SHA-512 of a stored file.
    pub async fn sha512(&self, storage_name: &str) -> Result<String> {
        let mut file = File::open(self.path_of(storage_name)).await?;
        let mut hasher = Sha512::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_create_makes_shard_directory() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());

        let mut file = storage.create("17/3-.__a.log.gz").await.unwrap();
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();

        assert!(dir.path().join("17").is_dir());
        assert_eq!(storage.size_of("17/3-.__a.log.gz").await.unwrap(), Some(5));
        assert_eq!(storage.size_of("17/nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_files() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.create("1/1-x").await.unwrap();

        assert!(storage.remove("1/1-x").await.unwrap());
        assert!(!storage.remove("1/1-x").await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_requires_sentinel() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(matches!(storage.probe().await, Err(BeamlineError::Storage(_))));

        storage.initialize().await.unwrap();
        storage.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_sentinel() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.initialize().await.unwrap();
        storage.create("2/5-b").await.unwrap();
        storage.create("1/4-a").await.unwrap();

        assert_eq!(storage.list().unwrap(), vec!["1/4-a", "2/5-b"]);
    }

    #[tokio::test]
    async fn test_sha512_of_known_content() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let mut file = storage.create("0/1-abc").await.unwrap();
        file.write_all(b"abc").await.unwrap();
        file.flush().await.unwrap();

        let digest = storage.sha512("0/1-abc").await.unwrap();
        assert!(digest.starts_with("ddaf35a193617aba"));
        assert_eq!(digest.len(), 128);
    }
}
