//! Watched folders: filtering, the entity registry and event dispatch.

pub mod filter;
pub mod supervisor;

pub use filter::PathFilter;
pub use supervisor::{FolderWatchSupervisor, WatchHandle, WatchState};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, CreateKind, RemoveKind};
use notify::EventKind;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::mysql::{dump_timestamp, MySqlJob};
use crate::storage::{ObjectLocation, SessionHandle};
use crate::sync::{Action, Priority, Reconciler, WatchedEntity};
use crate::utils::config::FolderConfig;

pub type SharedEntity = Arc<tokio::sync::Mutex<WatchedEntity>>;

/// The filesystem events a folder reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEvent {
    Created(PathBuf),
    Closed(PathBuf),
    Deleted(PathBuf),
}

impl FolderEvent {
    pub fn from_notify(event: &notify::Event) -> Vec<FolderEvent> {
        let make: fn(PathBuf) -> FolderEvent = match event.kind {
            EventKind::Create(CreateKind::File | CreateKind::Any) => FolderEvent::Created,
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => FolderEvent::Closed,
            EventKind::Remove(RemoveKind::File | RemoveKind::Any) => FolderEvent::Deleted,
            _ => return Vec::new(),
        };
        event.paths.iter().cloned().map(make).collect()
    }

    pub fn path(&self) -> &Path {
        match self {
            FolderEvent::Created(path) | FolderEvent::Closed(path) | FolderEvent::Deleted(path) => path,
        }
    }
}

pub enum FolderKind {
    Plain,
    /// Bin-log directory of a MySQL job. Closed segments trigger a dump
    /// which is synced through `dumps`.
    Binlog {
        job: Arc<MySqlJob>,
        dumps: Arc<WatchedFolder>,
    },
}

pub struct WatchedFolder {
    root: PathBuf,
    filter: PathFilter,
    priority: Priority,
    bucket: String,
    prefix: String,
    session: SessionHandle,
    auto_create: bool,
    reconciler: Reconciler,
    kind: FolderKind,
    registry: Mutex<HashMap<PathBuf, SharedEntity>>,
}

impl WatchedFolder {
    pub fn new(
        root: PathBuf,
        config: &FolderConfig,
        session: SessionHandle,
        reconciler: Reconciler,
        kind: FolderKind,
    ) -> Result<Self> {
        let prefix = match &config.s3.prefix_key {
            Some(prefix) => prefix.clone(),
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        let folder = Self {
            filter: PathFilter::from_config(config)?,
            priority: config.priority,
            bucket: config.s3.bucket_name.clone(),
            prefix,
            session,
            auto_create: config.auto_create,
            reconciler,
            kind,
            registry: Mutex::new(HashMap::new()),
            root,
        };
        info!(
            "Folder {} -> {}/{} ({:?} priority)",
            folder.root.display(),
            folder.bucket,
            crate::storage::prefix_key(&folder.prefix),
            folder.priority
        );
        Ok(folder)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> &FolderKind {
        &self.kind
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Makes sure the root exists, creating it when allowed
    pub fn ensure_root(&self) -> Result<()> {
        if self.root.is_dir() {
            return Ok(());
        }
        if self.auto_create {
            std::fs::create_dir_all(&self.root)?;
            info!("Folder {} successfully created", self.root.display());
            return Ok(());
        }
        Err(SyncError::not_found(self.root.display()))
    }

    /// Folder rules plus, for bin-log folders, the segment pattern
    pub fn admits(&self, path: &Path) -> bool {
        if !self.filter.admits(path) {
            return false;
        }
        match &self.kind {
            FolderKind::Plain => true,
            FolderKind::Binlog { job, .. } => path
                .file_name()
                .map(|n| job.is_segment(&n.to_string_lossy()))
                .unwrap_or(false),
        }
    }

    /// Registered entity for `path`, created on first sight.
    ///
    /// `None` when the path is outside the root or not admitted.
    pub fn entity(&self, path: &Path) -> Option<SharedEntity> {
        if !self.admits(path) {
            return None;
        }
        let relative = path.strip_prefix(&self.root).ok()?;
        if relative.as_os_str().is_empty() {
            return None;
        }

        let mut registry = self.registry.lock();
        let entity = registry.entry(path.to_path_buf()).or_insert_with(|| {
            debug!("New file added to folder monitoring {}", path.display());
            let object = ObjectLocation::new(&self.bucket, &self.prefix, relative, self.session.clone());
            Arc::new(tokio::sync::Mutex::new(WatchedEntity::new(path, object, self.priority)))
        });
        Some(entity.clone())
    }

    /// Entity for `path` only if it was registered before
    pub fn registered(&self, path: &Path) -> Option<SharedEntity> {
        self.registry.lock().get(path).cloned()
    }

    /// Registered entities ordered by path
    pub fn entities(&self) -> Vec<SharedEntity> {
        let registry = self.registry.lock();
        let mut paths: Vec<&PathBuf> = registry.keys().collect();
        paths.sort();
        paths.into_iter().map(|p| registry[p].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers every admitted file below the root, plus the literal
    /// names at the root even when they only exist remotely.
    pub fn scan(&self) -> usize {
        if !self.root.is_dir() {
            return 0;
        }
        let before = self.len();

        for name in self.filter.names() {
            self.entity(&self.root.join(name));
        }
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            self.entity(entry.path());
        }

        let added = self.len() - before;
        if added > 0 {
            debug!("Scan of {} registered {} new files", self.root.display(), added);
        }
        added
    }

    /// Scans, then reconciles every entity. Returns how many failed.
    pub async fn reconcile_pass(&self) -> usize {
        if !self.root.is_dir() {
            debug!("Skipping reconciliation of missing {}", self.root.display());
            return 0;
        }
        self.scan();

        let mut failures = 0;
        for entity in self.entities() {
            let mut entity = entity.lock().await;
            if let Err(e) = self.reconciler.reconcile(&mut entity).await {
                failures += 1;
                log_entity_error(entity.local_path(), &e);
            }
        }
        failures
    }

    /// Registers and reconciles a single path
    pub async fn sync_path(&self, path: &Path) -> Result<Action> {
        let entity = self.entity(path).ok_or_else(|| {
            SyncError::config(format!(
                "{} is not admitted by folder {}",
                path.display(),
                self.root.display()
            ))
        })?;
        let mut entity = entity.lock().await;
        self.reconciler.reconcile(&mut entity).await
    }

    /// Applies one filesystem event. Failures are logged, never returned.
    pub async fn handle_event(&self, event: FolderEvent) {
        match event {
            FolderEvent::Created(path) => {
                if path.is_dir() {
                    return;
                }
                let Some(entity) = self.entity(&path) else {
                    return;
                };
                let entity = entity.lock().await;
                if written_by_download(&entity).await {
                    return;
                }
                if let Err(e) = self.reconciler.upload(&entity).await {
                    debug!(
                        "Upload of new file {} failed, waiting for close: {}",
                        path.display(),
                        e
                    );
                }
            }
            FolderEvent::Closed(path) => {
                let Some(entity) = self.entity(&path) else {
                    return;
                };
                {
                    let entity = entity.lock().await;
                    if !written_by_download(&entity).await {
                        debug!("{} closed, uploading newer version", path.display());
                        if let Err(e) = self.reconciler.upload(&entity).await {
                            log_entity_error(&path, &e);
                        }
                    }
                }
                if let FolderKind::Binlog { job, dumps } = &self.kind {
                    dump_after_segment_close(job, dumps, &path).await;
                }
            }
            FolderEvent::Deleted(path) => {
                let Some(entity) = self.registered(&path) else {
                    return;
                };
                let entity = entity.lock().await;
                info!("{} deleted, creating remote backup", path.display());
                if let Err(e) = self.reconciler.backup_remote(&entity).await {
                    log_entity_error(&path, &e);
                }
            }
        }
    }
}

/// The file still has the modification time of our own last download
async fn written_by_download(entity: &WatchedEntity) -> bool {
    if entity.last_known_local_modified().is_none() {
        return false;
    }
    match entity.local_has_changed().await {
        Ok(changed) => {
            if !changed {
                debug!("{} unchanged since download", entity.local_path().display());
            }
            !changed
        }
        Err(_) => false,
    }
}

async fn dump_after_segment_close(job: &MySqlJob, dumps: &WatchedFolder, segment: &Path) {
    let segment_name = segment
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!("{} closed, triggering dump for job {}", segment_name, job.name());

    let name = format!("{}-{}.sql", segment_name, dump_timestamp());
    match job.create_dump(&name).await {
        Ok(path) => {
            if let Err(e) = dumps.sync_path(&path).await {
                log_entity_error(&path, &e);
            }
        }
        Err(e) => error!("Dump for job {} failed: {}", job.name(), e),
    }
}

pub(crate) fn log_entity_error(path: &Path, e: &SyncError) {
    if e.is_recoverable() {
        warn!("{}: {}", path.display(), e);
    } else {
        error!("{}: {}", path.display(), e);
    }
}
