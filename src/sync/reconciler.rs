//! Decides and executes the action that brings one entity back in sync.
//!
//! [`decide`] is pure. [`Reconciler`] gathers the live local and remote state,
//! asks [`decide`], and carries the resulting action out against the object
//! store.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Action, Priority, WatchedEntity};
use crate::error::{bounded, Result, SyncError};

/// Size and modification time of one side of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Maps local and remote state to an action. First matching row wins.
///
/// Timestamps are compared at second precision, which is all the object
/// store reports. `tie_break` is only consulted when sizes differ and the
/// timestamps are equal.
pub fn decide(local: Option<FileState>, remote: Option<FileState>, tie_break: Option<Priority>) -> Action {
    match (local, remote) {
        (Some(local), Some(remote)) => {
            if local.size == remote.size {
                return Action::None;
            }
            let local_secs = local.modified.timestamp();
            let remote_secs = remote.modified.timestamp();
            if local_secs == remote_secs {
                match tie_break {
                    Some(Priority::Cloud) => Action::BackupThenDownload,
                    Some(Priority::Local) => Action::BackupThenUpload,
                    None => Action::None,
                }
            } else if remote_secs > local_secs {
                Action::Download
            } else {
                Action::BackupThenUpload
            }
        }
        (None, Some(_)) => Action::DownloadInitial,
        (Some(_), None) => Action::UploadInitial,
        (None, None) => Action::None,
    }
}

/// Executes reconciliation actions for the entities of one folder
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    timeout: Option<Duration>,
    tie_break: bool,
}

impl Reconciler {
    pub fn new(timeout: Option<Duration>, tie_break: bool) -> Self {
        Self { timeout, tie_break }
    }

    /// Decides without touching anything
    pub async fn plan(&self, entity: &WatchedEntity) -> Result<Action> {
        let local = entity.local_state().await?;
        let remote = bounded(self.timeout, entity.object().head())
            .await?
            .map(|meta| FileState {
                size: meta.size,
                modified: meta.last_modified,
            });
        let tie_break = self.tie_break.then_some(entity.priority());

        let action = decide(local, remote, tie_break);
        if action == Action::None && local.is_some() && remote.is_some() {
            debug!("{} not modified", entity.object().display());
        }
        Ok(action)
    }

    /// Decides and carries out the action, returning what was actually done
    pub async fn reconcile(&self, entity: &mut WatchedEntity) -> Result<Action> {
        let action = self.plan(entity).await?;
        self.execute(entity, action).await
    }

    /// Carries out `action`. An upload skipped for an empty file reports `None`.
    pub async fn execute(&self, entity: &mut WatchedEntity, action: Action) -> Result<Action> {
        match action {
            Action::None => {}
            Action::Upload | Action::UploadInitial | Action::BackupThenUpload => {
                if !self.upload(entity).await? {
                    return Ok(Action::None);
                }
            }
            Action::Download | Action::DownloadInitial => {
                self.download(entity).await?;
            }
            Action::BackupThenDownload => {
                self.backup_local(entity).await?;
                self.download(entity).await?;
            }
        }
        Ok(action)
    }

    /// Uploads the local file, backing up any object it would overwrite.
    ///
    /// Returns false when nothing was sent because the file is empty.
    pub async fn upload(&self, entity: &WatchedEntity) -> Result<bool> {
        let object = entity.object();
        let data = match tokio::fs::read(entity.local_path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::not_found(entity.local_path().display()));
            }
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            debug!("{} is empty, not uploading", entity.local_path().display());
            return Ok(false);
        }

        if let Err(e) = self.backup_remote(entity).await {
            warn!("Backup of {} failed, uploading anyway: {}", object.display(), e);
        }

        let size = data.len();
        bounded(self.timeout, object.upload(Bytes::from(data))).await?;
        info!(
            "Uploaded {} to {} ({} bytes)",
            entity.local_path().display(),
            object.display(),
            size
        );
        Ok(true)
    }

    /// Copies the current remote object to its timestamped backup key.
    ///
    /// Returns the backup key, or `None` when there is no object to save.
    pub async fn backup_remote(&self, entity: &WatchedEntity) -> Result<Option<String>> {
        let object = entity.object();
        let Some(meta) = bounded(self.timeout, object.head()).await? else {
            debug!("{} has no remote object to back up", object.display());
            return Ok(None);
        };

        let backup_key = object.backup_key(meta.last_modified.timestamp(), &entity.extension());
        bounded(self.timeout, object.copy_to(&backup_key)).await?;
        info!("Backed up {} to {}/{}", object.display(), object.bucket(), backup_key);
        Ok(Some(backup_key))
    }

    /// Saves the local content under a backup key before it gets replaced
    async fn backup_local(&self, entity: &WatchedEntity) -> Result<()> {
        let object = entity.object();
        let Some(local) = entity.local_state().await? else {
            return Ok(());
        };
        let data = tokio::fs::read(entity.local_path()).await?;
        let backup_key = object.backup_key(local.modified.timestamp(), &entity.extension());
        bounded(
            self.timeout,
            object
                .session()
                .upload(object.bucket(), &backup_key, Bytes::from(data)),
        )
        .await?;
        info!(
            "Saved local {} to {}/{} before download",
            entity.local_path().display(),
            object.bucket(),
            backup_key
        );
        Ok(())
    }

    async fn download(&self, entity: &mut WatchedEntity) -> Result<()> {
        let data = bounded(self.timeout, entity.object().download()).await?;
        if let Some(parent) = entity.local_path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(entity.local_path(), &data).await?;

        if let Some(state) = entity.local_state().await? {
            entity.set_last_known_local_modified(state.modified);
        }
        info!(
            "Downloaded {} to {} ({} bytes)",
            entity.object().display(),
            entity.local_path().display(),
            data.len()
        );
        Ok(())
    }
}
