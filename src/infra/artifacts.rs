//! Artifact storage backends.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::application::artifacts::{ArtifactStore, StorageError};

/// Filesystem-backed artifact storage.
#[derive(Debug)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve the absolute filesystem path for a storage key.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::CurDir | Component::Prefix(_)
                )
            })
        {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    /// Writes to a sibling temp file and renames, so readers never see a partial object.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let absolute = self.resolve(key)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut staging = absolute.clone().into_os_string();
        staging.push(format!(".tmp-{}", Uuid::new_v4()));
        let staging = PathBuf::from(staging);

        let mut file = fs::File::create(&staging).await?;
        if let Err(err) = file.write_all(&bytes).await {
            drop(file);
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&staging, &absolute).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let absolute = self.resolve(key)?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let absolute = self.resolve(key)?;
        Ok(fs::try_exists(&absolute).await?)
    }
}

/// In-memory artifact storage for the memory backend and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryArtifactStore {
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.objects.remove(key).map(|(_, bytes)| bytes)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.objects
            .get(key)
            .map(|bytes| bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.contains_key(key))
    }
}
