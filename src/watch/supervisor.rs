use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{FolderEvent, WatchedFolder};
use crate::error::{Result, SyncError};

/// Events buffered per folder before the watcher thread blocks
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Stopped,
    Running,
    Dead,
}

/// One armed recursive watch and the task dispatching its events
pub struct WatchHandle {
    root: PathBuf,
    watcher: RecommendedWatcher,
    alive: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl WatchHandle {
    /// Arms a recursive watch on the folder root.
    ///
    /// Fails with `PathNotFound` when the root is missing and cannot be created.
    pub fn start(folder: Arc<WatchedFolder>) -> Result<Self> {
        folder.ensure_root()?;
        let root = folder.root().to_path_buf();

        let (tx, mut rx) = mpsc::channel::<FolderEvent>(EVENT_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));

        let callback_alive = alive.clone();
        let callback_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for folder_event in FolderEvent::from_notify(&event) {
                    // Blocks the watcher thread while the dispatcher catches up
                    if tx.blocking_send(folder_event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Watch error on {}: {}", callback_root.display(), e);
                callback_alive.store(false, Ordering::SeqCst);
            }
        })
        .map_err(|e| watch_error(&root, e))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(&root, e))?;

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                folder.handle_event(event).await;
            }
        });

        Ok(Self {
            root,
            watcher,
            alive,
            dispatcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watcher healthy, dispatcher running and root still present
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.dispatcher.is_finished() && self.root.is_dir()
    }

    /// Disarms the watch and waits for queued events to be processed.
    ///
    /// An `Err` means the dispatcher panicked.
    pub async fn stop(self) -> Result<()> {
        let root = self.root.clone();
        join_dispatcher(&root, self.detach()).await
    }

    /// Disarms the watch and hands back the dispatcher, which keeps draining
    /// the events already queued.
    pub fn detach(self) -> JoinHandle<()> {
        let Self {
            root,
            mut watcher,
            dispatcher,
            ..
        } = self;
        if let Err(e) = watcher.unwatch(&root) {
            debug!("Unwatch of {} failed: {}", root.display(), e);
        }
        // Dropping the watcher closes the channel and ends the dispatcher
        drop(watcher);
        dispatcher
    }
}

/// Waits for a dispatcher. `Err` when it panicked.
async fn join_dispatcher(root: &Path, dispatcher: JoinHandle<()>) -> Result<()> {
    match dispatcher.await {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => Err(SyncError::WatchHandle {
            path: root.to_path_buf(),
            message: "event dispatcher panicked".to_string(),
        }),
        Err(_) => Ok(()),
    }
}

fn watch_error(root: &Path, e: notify::Error) -> SyncError {
    match e.kind {
        notify::ErrorKind::PathNotFound => SyncError::not_found(root.display()),
        _ => SyncError::WatchHandle {
            path: root.to_path_buf(),
            message: e.to_string(),
        },
    }
}

struct Supervised {
    folder: Arc<WatchedFolder>,
    handle: Option<WatchHandle>,
    state: WatchState,
    failed_restarts: u32,
    disabled: bool,
    started_seq: Option<u64>,
}

/// Keeps one watch per folder alive, restarting dead ones on every pass.
pub struct FolderWatchSupervisor {
    name: String,
    folders: Vec<Supervised>,
    /// Dispatchers of replaced handles still working through their queue
    draining: Vec<(PathBuf, JoinHandle<()>)>,
    max_restart_attempts: u32,
    next_seq: u64,
}

impl FolderWatchSupervisor {
    pub fn new(name: impl Into<String>, max_restart_attempts: u32) -> Self {
        Self {
            name: name.into(),
            folders: Vec::new(),
            draining: Vec::new(),
            max_restart_attempts,
            next_seq: 0,
        }
    }

    pub fn add(&mut self, folder: Arc<WatchedFolder>) {
        self.folders.push(Supervised {
            folder,
            handle: None,
            state: WatchState::Stopped,
            failed_restarts: 0,
            disabled: false,
            started_seq: None,
        });
    }

    pub fn folders(&self) -> Vec<Arc<WatchedFolder>> {
        self.folders.iter().map(|s| s.folder.clone()).collect()
    }

    pub fn state(&self, root: &Path) -> Option<WatchState> {
        self.folders
            .iter()
            .find(|s| s.folder.root() == root)
            .map(|s| s.state)
    }

    /// Number of folders currently watched
    pub fn running(&self) -> usize {
        self.folders
            .iter()
            .filter(|s| s.state == WatchState::Running)
            .count()
    }

    /// Starts every folder and registers its existing files.
    ///
    /// Folders whose root is missing stay `Stopped` and are retried by
    /// [`health_check_pass`](Self::health_check_pass).
    pub fn start_all(&mut self) {
        for index in 0..self.folders.len() {
            if self.folders[index].handle.is_none() {
                self.try_start(index);
            }
        }
        info!(
            "{} supervisor: {}/{} folders watched",
            self.name,
            self.running(),
            self.folders.len()
        );
    }

    fn try_start(&mut self, index: usize) -> Option<SyncError> {
        let supervised = &mut self.folders[index];
        match WatchHandle::start(supervised.folder.clone()) {
            Ok(handle) => {
                let registered = supervised.folder.scan();
                info!(
                    "Watching {} ({} files registered)",
                    supervised.folder.root().display(),
                    registered
                );
                supervised.handle = Some(handle);
                supervised.state = WatchState::Running;
                supervised.failed_restarts = 0;
                supervised.started_seq = Some(self.next_seq);
                self.next_seq += 1;
                None
            }
            Err(e) => {
                if e.is_not_found() {
                    warn!(
                        "Folder {} does not exist, will retry",
                        supervised.folder.root().display()
                    );
                } else {
                    error!(
                        "Failed to watch {}: {}",
                        supervised.folder.root().display(),
                        e
                    );
                }
                supervised.state = WatchState::Stopped;
                Some(e)
            }
        }
    }

    /// Restarts every folder whose watch is not alive.
    ///
    /// Never waits on a dead handle's dispatcher: it is detached and checked
    /// again on later passes. Returns `Err` only when a dispatcher panicked,
    /// which is fatal.
    pub async fn health_check_pass(&mut self) -> Result<()> {
        self.reap_drained().await?;

        for index in 0..self.folders.len() {
            let supervised = &mut self.folders[index];
            if supervised.disabled {
                continue;
            }
            if let Some(handle) = &supervised.handle {
                if handle.is_alive() {
                    continue;
                }
            }

            if let Some(handle) = supervised.handle.take() {
                let root = handle.root().to_path_buf();
                warn!("Watch on {} is not alive", root.display());
                supervised.state = WatchState::Dead;
                let dispatcher = handle.detach();
                if dispatcher.is_finished() {
                    join_dispatcher(&root, dispatcher).await?;
                } else {
                    debug!("Dispatcher of {} still draining", root.display());
                    self.draining.push((root, dispatcher));
                }
            }

            let Some(error) = self.try_start(index) else {
                continue;
            };
            if error.is_not_found() {
                continue;
            }

            let supervised = &mut self.folders[index];
            supervised.failed_restarts += 1;
            if supervised.failed_restarts >= self.max_restart_attempts {
                error!(
                    "Disabling {} after {} failed restarts",
                    supervised.folder.root().display(),
                    supervised.failed_restarts
                );
                supervised.disabled = true;
            }
        }
        Ok(())
    }

    /// Joins detached dispatchers that have finished
    async fn reap_drained(&mut self) -> Result<()> {
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.draining)
            .into_iter()
            .partition(|(_, dispatcher)| dispatcher.is_finished());
        self.draining = pending;

        for (root, dispatcher) in finished {
            join_dispatcher(&root, dispatcher).await?;
            debug!("Dispatcher of {} drained", root.display());
        }
        Ok(())
    }

    /// Whether the folder was given up on after repeated restart failures
    pub fn is_disabled(&self, root: &Path) -> bool {
        self.folders
            .iter()
            .any(|s| s.folder.root() == root && s.disabled)
    }

    /// Stops and joins every watch in the order they were started
    pub async fn stop_all(&mut self) -> Result<()> {
        let mut started: Vec<(u64, WatchHandle)> = self
            .folders
            .iter_mut()
            .filter_map(|s| {
                s.state = WatchState::Stopped;
                let handle = s.handle.take()?;
                Some((s.started_seq.unwrap_or(u64::MAX), handle))
            })
            .collect();
        started.sort_by_key(|(seq, _)| *seq);

        let mut fatal = None;
        for (_, handle) in started {
            let root = handle.root().to_path_buf();
            match handle.stop().await {
                Ok(()) => debug!("Stopped watch on {}", root.display()),
                Err(e) => {
                    error!("{}", e);
                    fatal.get_or_insert(e);
                }
            }
        }
        for (root, dispatcher) in std::mem::take(&mut self.draining) {
            if let Err(e) = join_dispatcher(&root, dispatcher).await {
                error!("{}", e);
                fatal.get_or_insert(e);
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryObjectStore, ObjectMetadata, ObjectStore, SessionHandle};
    use crate::sync::{Priority, Reconciler};
    use crate::utils::config::{FolderConfig, S3Config};
    use crate::watch::FolderKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Store whose calls never complete
    #[derive(Default)]
    struct StalledStore {
        calls: AtomicUsize,
    }

    impl StalledStore {
        async fn stall<T>(&self) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn metadata(&self, _: &str, _: &str) -> Result<ObjectMetadata> {
            self.stall().await
        }

        async fn upload(&self, _: &str, _: &str, _: Bytes) -> Result<()> {
            self.stall().await
        }

        async fn download(&self, _: &str, _: &str) -> Result<Bytes> {
            self.stall().await
        }

        async fn copy(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
            self.stall().await
        }
    }

    /// Store that brings down whichever task calls it
    struct PanickingStore;

    #[async_trait]
    impl ObjectStore for PanickingStore {
        async fn metadata(&self, _: &str, _: &str) -> Result<ObjectMetadata> {
            panic!("metadata");
        }

        async fn upload(&self, _: &str, _: &str, _: Bytes) -> Result<()> {
            panic!("upload");
        }

        async fn download(&self, _: &str, _: &str) -> Result<Bytes> {
            panic!("download");
        }

        async fn copy(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
            panic!("copy");
        }
    }

    fn folder_on(root: PathBuf, session: SessionHandle, auto_create: bool) -> Arc<WatchedFolder> {
        let config = FolderConfig {
            priority: Priority::Local,
            whitelist: Vec::new(),
            whitelist_regex: vec![".*".to_string()],
            blacklist_regex: Vec::new(),
            auto_create,
            tie_break: false,
            s3: S3Config {
                bucket_name: "bucket".to_string(),
                prefix_key: None,
                iam_override: None,
            },
        };
        Arc::new(
            WatchedFolder::new(root, &config, session, Reconciler::default(), FolderKind::Plain)
                .unwrap(),
        )
    }

    fn folder(root: PathBuf) -> Arc<WatchedFolder> {
        folder_on(root, Arc::new(MemoryObjectStore::new()), false)
    }

    #[tokio::test]
    async fn test_start_on_missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = WatchHandle::start(folder(dir.path().join("missing"))).err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_root_is_retried_until_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("late");
        let mut supervisor = FolderWatchSupervisor::new("test", 3);
        supervisor.add(folder(root.clone()));

        supervisor.start_all();
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));

        supervisor.health_check_pass().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));

        std::fs::create_dir(&root).unwrap();
        supervisor.health_check_pass().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Running));

        supervisor.stop_all().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));
    }

    #[tokio::test]
    async fn test_removed_root_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();

        let mut supervisor = FolderWatchSupervisor::new("test", 3);
        supervisor.add(folder(root.clone()));
        supervisor.start_all();
        assert_eq!(supervisor.running(), 1);

        std::fs::remove_dir(&root).unwrap();
        supervisor.health_check_pass().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));

        std::fs::create_dir(&root).unwrap();
        supervisor.health_check_pass().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Running));
        supervisor.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_error_triggers_restart() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();

        let mut supervisor = FolderWatchSupervisor::new("test", 3);
        supervisor.add(folder(root.clone()));
        supervisor.start_all();
        let first_seq = supervisor.folders[0].started_seq;

        // What the notify callback does on an error
        let handle = supervisor.folders[0].handle.as_ref().unwrap();
        handle.alive.store(false, Ordering::SeqCst);
        assert!(!handle.is_alive());

        supervisor.health_check_pass().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Running));
        assert!(supervisor.folders[0].handle.as_ref().unwrap().is_alive());
        assert_ne!(supervisor.folders[0].started_seq, first_seq);
        supervisor.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_restart_failures_disable_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let root = blocker.join("watched");

        let mut supervisor = FolderWatchSupervisor::new("test", 2);
        supervisor.add(folder_on(root.clone(), Arc::new(MemoryObjectStore::new()), true));
        supervisor.start_all();
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));

        supervisor.health_check_pass().await.unwrap();
        assert!(!supervisor.is_disabled(&root));
        supervisor.health_check_pass().await.unwrap();
        assert!(supervisor.is_disabled(&root));

        // Never retried once disabled, even if the root becomes usable
        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        supervisor.health_check_pass().await.unwrap();
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));
        supervisor.stop_all().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_dispatcher_does_not_block_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        let store = Arc::new(StalledStore::default());

        let mut supervisor = FolderWatchSupervisor::new("test", 3);
        supervisor.add(folder_on(root.clone(), store.clone(), false));
        supervisor.start_all();

        std::fs::write(root.join("a.txt"), "stuck upload").unwrap();
        for _ in 0..100 {
            if store.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(store.calls.load(Ordering::SeqCst) > 0);

        std::fs::remove_dir_all(&root).unwrap();
        let pass = tokio::time::timeout(Duration::from_secs(3), supervisor.health_check_pass()).await;
        assert!(matches!(pass, Ok(Ok(()))));
        assert_eq!(supervisor.state(&root), Some(WatchState::Stopped));
        assert_eq!(supervisor.draining.len(), 1);

        // Re-armed without waiting for the stuck dispatcher
        std::fs::create_dir(&root).unwrap();
        let pass = tokio::time::timeout(Duration::from_secs(3), supervisor.health_check_pass()).await;
        assert!(matches!(pass, Ok(Ok(()))));
        assert_eq!(supervisor.state(&root), Some(WatchState::Running));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicked_dispatcher_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();

        let mut supervisor = FolderWatchSupervisor::new("test", 3);
        supervisor.add(folder_on(root.clone(), Arc::new(PanickingStore), false));
        supervisor.start_all();

        std::fs::write(root.join("a.txt"), "boom").unwrap();

        let mut outcome = Ok(());
        for _ in 0..100 {
            outcome = supervisor.health_check_pass().await;
            if outcome.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        match outcome {
            Err(SyncError::WatchHandle { path, .. }) => assert_eq!(path, root),
            other => panic!("expected a fatal watch failure, got {:?}", other),
        }
    }
}
