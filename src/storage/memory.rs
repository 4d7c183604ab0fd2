//! In-process object store.
//!
//! Used when no remote endpoint should be touched (`--check` runs, tests).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ObjectMetadata, ObjectStore};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object with an explicit modification time
    pub fn put_at(&self, bucket: &str, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// All keys of `bucket` in lexical order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Makes every call fail with a transport error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::transport("object store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        self.check_available()?;
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| ObjectMetadata {
                size: o.data.len() as u64,
                last_modified: o.last_modified,
            })
            .ok_or_else(|| SyncError::not_found(format!("{}/{}", bucket, key)))
    }

    async fn upload(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.check_available()?;
        self.put_at(bucket, key, body, Utc::now());
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.check_available()?;
        self.get(bucket, key)
            .ok_or_else(|| SyncError::not_found(format!("{}/{}", bucket, key)))
    }

    async fn copy(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> Result<()> {
        self.check_available()?;
        let data = self
            .get(src_bucket, src_key)
            .ok_or_else(|| SyncError::not_found(format!("{}/{}", src_bucket, src_key)))?;
        self.put_at(dst_bucket, dst_key, data, Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_preserves_content() {
        let store = MemoryObjectStore::new();
        store.upload("b", "k", Bytes::from_static(b"payload")).await.unwrap();
        store.copy("b", "k", "b", "k-1").await.unwrap();
        assert_eq!(store.get("b", "k-1").unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(store.keys("b"), vec!["k".to_string(), "k-1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.metadata("b", "nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists("b", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_is_transport_error() {
        let store = MemoryObjectStore::new();
        store.set_unavailable(true);
        let err = store.exists("b", "k").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
