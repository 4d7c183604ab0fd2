pub mod reconciler;

pub use reconciler::{decide, FileState, Reconciler};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::storage::ObjectLocation;

/// Which side wins a genuinely simultaneous change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Local,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Upload,
    Download,
    BackupThenUpload,
    BackupThenDownload,
    DownloadInitial,
    UploadInitial,
}

/// A locally tracked file paired with its remote object
#[derive(Debug, Clone)]
pub struct WatchedEntity {
    local_path: PathBuf,
    object: ObjectLocation,
    priority: Priority,
    last_known_local_modified: Option<DateTime<Utc>>,
}

impl WatchedEntity {
    pub fn new(local_path: impl Into<PathBuf>, object: ObjectLocation, priority: Priority) -> Self {
        Self {
            local_path: local_path.into(),
            object,
            priority,
            last_known_local_modified: None,
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn object(&self) -> &ObjectLocation {
        &self.object
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Local modification time recorded after the last successful download
    pub fn last_known_local_modified(&self) -> Option<DateTime<Utc>> {
        self.last_known_local_modified
    }

    pub(crate) fn set_last_known_local_modified(&mut self, modified: DateTime<Utc>) {
        self.last_known_local_modified = Some(modified);
    }

    /// File extension with its dot, empty when there is none
    pub fn extension(&self) -> String {
        self.local_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }

    /// Live size and modification time, `None` when the file does not exist
    pub async fn local_state(&self) -> Result<Option<FileState>> {
        match tokio::fs::metadata(&self.local_path).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileState {
                size: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified()?),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// True when the file changed since the last download.
    ///
    /// An entity that was never downloaded counts as changed.
    pub async fn local_has_changed(&self) -> Result<bool> {
        let current = self.local_state().await?;
        Ok(match (self.last_known_local_modified, current) {
            (Some(known), Some(state)) => known < state.modified,
            (None, Some(_)) => true,
            (_, None) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use std::sync::Arc;

    fn entity(path: &Path) -> WatchedEntity {
        let object = ObjectLocation::new(
            "bucket",
            "docs",
            Path::new("a.txt"),
            Arc::new(MemoryObjectStore::new()),
        );
        WatchedEntity::new(path, object, Priority::Local)
    }

    #[test]
    fn test_extension() {
        assert_eq!(entity(Path::new("/tmp/a.txt")).extension(), ".txt");
        assert_eq!(entity(Path::new("/tmp/Makefile")).extension(), "");
    }

    #[tokio::test]
    async fn test_local_state_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let entity = entity(&dir.path().join("absent"));
        assert!(entity.local_state().await.unwrap().is_none());
        assert!(!entity.local_has_changed().await.unwrap());
    }

    #[tokio::test]
    async fn test_local_has_changed_after_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let mut entity = entity(&path);
        assert!(entity.local_has_changed().await.unwrap());

        let state = entity.local_state().await.unwrap().unwrap();
        assert_eq!(state.size, 5);
        entity.set_last_known_local_modified(state.modified);
        assert!(!entity.local_has_changed().await.unwrap());
    }
}
