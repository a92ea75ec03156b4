//! Blob storage for compilation products and logs.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use thiserror::Error;

use crate::domain::task::TaskKey;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no object stored under `{key}`")]
    NotFound { key: String },
    #[error("invalid storage key `{key}`")]
    InvalidKey { key: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Key → bytes persistence. A key is written at most once per attempt.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Deterministic key of the compiled product for `key`.
///
/// The checksum is base64url-encoded so that arbitrary upstream values (quotes, slashes,
/// dots) always map to a single path component.
pub fn artifact_key(key: &TaskKey) -> String {
    let format = key.output_format();
    format!("{}/{}.{}", key_prefix(key), format, format.extension())
}

/// Deterministic key of the compilation log for `key`.
pub fn log_key(key: &TaskKey) -> String {
    format!("{}/{}.log", key_prefix(key), key.output_format())
}

fn key_prefix(key: &TaskKey) -> String {
    format!(
        "{}/{}",
        urlencoding::encode(key.source_id()),
        URL_SAFE_NO_PAD.encode(key.checksum().as_bytes())
    )
}
