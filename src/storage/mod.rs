//! Remote object storage: the collaborator contract and object addressing.

pub mod memory;
pub mod s3;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::utils::config::IamOverride;

pub use memory::MemoryObjectStore;
pub use s3::{S3ObjectStore, SessionFactory};

/// Metadata of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Primitive operations of an object store.
///
/// `metadata` and `download` must return [`SyncError::PathNotFound`] for a
/// missing object and [`SyncError::Transport`] for every other failure.
///
/// [`SyncError::PathNotFound`]: crate::error::SyncError::PathNotFound
/// [`SyncError::Transport`]: crate::error::SyncError::Transport
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    async fn upload(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    async fn download(&self, bucket: &str, key: &str) -> Result<Bytes>;

    async fn copy(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str)
        -> Result<()>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.metadata(bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Credentialed session shared by every location created under the same override.
pub type SessionHandle = Arc<dyn ObjectStore>;

/// Resolves the session for a folder's optional IAM override
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self, iam_override: Option<&IamOverride>) -> Result<SessionHandle>;
}

/// Hands out one session regardless of override
pub struct SharedSession(pub SessionHandle);

#[async_trait]
impl SessionProvider for SharedSession {
    async fn session(&self, _iam_override: Option<&IamOverride>) -> Result<SessionHandle> {
        Ok(self.0.clone())
    }
}

/// Normalizes a configured prefix: no leading slash, exactly one trailing slash.
///
/// An empty prefix stays empty so keys land at the bucket root.
pub fn prefix_key(prefix: &str) -> String {
    let lean = lean_path(prefix);
    let trimmed = lean.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

/// Collapses repeated slashes.
pub fn lean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    out
}

/// One remote object: bucket, key and the session used to reach it.
#[derive(Clone)]
pub struct ObjectLocation {
    bucket: String,
    key: String,
    session: SessionHandle,
}

impl ObjectLocation {
    /// Builds the location of `relative` (a path below a watched root) under `prefix`.
    pub fn new(bucket: impl Into<String>, prefix: &str, relative: &Path, session: SessionHandle) -> Self {
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            bucket: bucket.into(),
            key: format!("{}{}", prefix_key(prefix), relative),
            session,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// `bucket/key`, for logs
    pub fn display(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Key of the timestamped backup copy: `key-<epochSeconds><ext>`.
    pub fn backup_key(&self, epoch_seconds: i64, ext: &str) -> String {
        format!("{}-{}{}", self.key, epoch_seconds, ext)
    }

    /// Remote metadata, `None` when the object does not exist
    pub async fn head(&self) -> Result<Option<ObjectMetadata>> {
        match self.session.metadata(&self.bucket, &self.key).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        self.session.exists(&self.bucket, &self.key).await
    }

    pub async fn upload(&self, body: Bytes) -> Result<()> {
        self.session.upload(&self.bucket, &self.key, body).await
    }

    pub async fn download(&self) -> Result<Bytes> {
        self.session.download(&self.bucket, &self.key).await
    }

    /// Copies this object to `backup_key` in the same bucket
    pub async fn copy_to(&self, backup_key: &str) -> Result<()> {
        self.session
            .copy(&self.bucket, &self.key, &self.bucket, backup_key)
            .await
    }
}

impl fmt::Debug for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectLocation")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionHandle {
        Arc::new(MemoryObjectStore::new())
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(prefix_key("/data/files"), "data/files/");
        assert_eq!(prefix_key("data/files/"), "data/files/");
        assert_eq!(prefix_key("data//files"), "data/files/");
        assert_eq!(prefix_key(""), "");
        assert_eq!(prefix_key("/"), "");
    }

    #[test]
    fn test_location_key_from_relative_path() {
        let location = ObjectLocation::new("bucket", "/backups", Path::new("etc/app.conf"), session());
        assert_eq!(location.key(), "backups/etc/app.conf");
        assert!(!location.key().starts_with('/'));
        assert_eq!(location.display(), "bucket/backups/etc/app.conf");
    }

    #[test]
    fn test_backup_key() {
        let location = ObjectLocation::new("bucket", "docs", Path::new("a.txt"), session());
        assert_eq!(location.backup_key(1_600_000_000, ".txt"), "docs/a.txt-1600000000.txt");
        assert_eq!(location.backup_key(5, ""), "docs/a.txt-5");
    }

    #[tokio::test]
    async fn test_head_maps_missing_object_to_none() {
        let location = ObjectLocation::new("bucket", "docs", Path::new("missing"), session());
        assert!(location.head().await.unwrap().is_none());
        assert!(!location.exists().await.unwrap());
    }
}
