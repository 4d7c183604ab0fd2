//! Cerberus: builds every folder and MySQL job, keeps their watches alive
//! and runs the shutdown sequence.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::mysql::{dump_timestamp, DumpTool, MySqlJob};
use crate::storage::SessionProvider;
use crate::sync::Reconciler;
use crate::utils::config::{resolve_path, JobConfig, Settings};
use crate::watch::{log_entity_error, FolderKind, FolderWatchSupervisor, WatchedFolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CerberusState {
    Init,
    Running,
    ShuttingDown,
    Stopped,
}

struct JobEntry {
    job: Arc<MySqlJob>,
    dumps: Arc<WatchedFolder>,
    scheduled: Option<JoinHandle<()>>,
}

pub struct Cerberus {
    state: CerberusState,
    settings: Settings,
    folders: FolderWatchSupervisor,
    mysql: FolderWatchSupervisor,
    jobs: Vec<JobEntry>,
    reconcile_task: Option<JoinHandle<()>>,
    last_reconcile: Instant,
}

impl Cerberus {
    /// Builds the folder and job registries. Nothing is watched yet.
    pub async fn build(
        config: &JobConfig,
        settings: Settings,
        sessions: &dyn SessionProvider,
        tool: Arc<dyn DumpTool>,
    ) -> Result<Self> {
        let timeout = settings.operation_timeout;
        let mut folders = FolderWatchSupervisor::new("folders", settings.max_restart_attempts);
        for (path, folder_config) in &config.folders {
            let session = sessions.session(folder_config.s3.iam_override.as_ref()).await?;
            let folder = WatchedFolder::new(
                resolve_path(path),
                folder_config,
                session,
                Reconciler::new(timeout, folder_config.tie_break),
                FolderKind::Plain,
            )?;
            folders.add(Arc::new(folder));
        }

        let mut mysql = FolderWatchSupervisor::new("mysql", settings.max_restart_attempts);
        let mut jobs = Vec::new();
        for (name, job_config) in &config.mysql_db {
            let job = Arc::new(MySqlJob::from_config(name, job_config, tool.clone(), timeout)?);

            let mut dumps_config = job_config.dumps_folder_config(name);
            dumps_config.auto_create = true;
            let dumps_session = sessions.session(dumps_config.s3.iam_override.as_ref()).await?;
            let dumps = Arc::new(WatchedFolder::new(
                job.dumps_path().to_path_buf(),
                &dumps_config,
                dumps_session,
                Reconciler::new(timeout, dumps_config.tie_break),
                FolderKind::Plain,
            )?);

            let binlog_config = &job_config.bin_logs.folder;
            let binlog_session = sessions.session(binlog_config.s3.iam_override.as_ref()).await?;
            let binlogs = WatchedFolder::new(
                job.binlog_root().to_path_buf(),
                binlog_config,
                binlog_session,
                Reconciler::new(timeout, binlog_config.tie_break),
                FolderKind::Binlog {
                    job: job.clone(),
                    dumps: dumps.clone(),
                },
            )?;

            mysql.add(Arc::new(binlogs));
            mysql.add(dumps.clone());
            jobs.push(JobEntry {
                job,
                dumps,
                scheduled: None,
            });
        }

        Ok(Self {
            state: CerberusState::Init,
            settings,
            folders,
            mysql,
            jobs,
            reconcile_task: None,
            last_reconcile: Instant::now(),
        })
    }

    pub fn state(&self) -> CerberusState {
        self.state
    }

    pub fn folders(&self) -> &FolderWatchSupervisor {
        &self.folders
    }

    pub fn mysql(&self) -> &FolderWatchSupervisor {
        &self.mysql
    }

    fn all_folders(&self) -> Vec<Arc<WatchedFolder>> {
        let mut all = self.folders.folders();
        all.extend(self.mysql.folders());
        all
    }

    /// Starts every watch and the initial reconciliation pass
    pub fn start(&mut self) {
        if self.state != CerberusState::Init {
            return;
        }
        self.folders.start_all();
        self.mysql.start_all();
        self.state = CerberusState::Running;
        info!(
            "Running with {} folders and {} MySQL jobs",
            self.folders.folders().len(),
            self.jobs.len()
        );
        self.spawn_reconcile_pass();
    }

    /// One supervision cycle. `Err` is fatal.
    pub async fn tick(&mut self) -> Result<()> {
        self.folders.health_check_pass().await?;
        self.mysql.health_check_pass().await?;

        if let Some(interval) = self.settings.reconcile_interval {
            if self.last_reconcile.elapsed() >= interval {
                self.spawn_reconcile_pass();
            }
        }
        self.spawn_scheduled_dumps();
        Ok(())
    }

    fn spawn_reconcile_pass(&mut self) {
        if let Some(task) = &self.reconcile_task {
            if !task.is_finished() {
                debug!("Reconciliation pass still running, skipping");
                return;
            }
        }

        let folders = self.all_folders();
        self.last_reconcile = Instant::now();
        self.reconcile_task = Some(tokio::spawn(async move {
            reconcile_folders(&folders).await;
        }));
    }

    fn spawn_scheduled_dumps(&mut self) {
        for entry in &mut self.jobs {
            if entry.scheduled.as_ref().is_some_and(|t| !t.is_finished()) {
                continue;
            }
            if !entry.job.dump_due() {
                continue;
            }

            let job = entry.job.clone();
            let dumps = entry.dumps.clone();
            info!("No dump for job {} during the last interval, scheduling one", job.name());
            entry.scheduled = Some(tokio::spawn(async move {
                let name = format!("scheduled_{}.sql", dump_timestamp());
                dump_and_sync(&job, &dumps, &name).await;
            }));
        }
    }

    /// Runs until `shutdown` is cancelled or a watch fails fatally
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.start();

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let fatal = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Termination requested");
                    break None;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Fatal watch failure: {}", e);
                        break Some(e);
                    }
                }
            }
        };

        self.shutdown(fatal).await
    }

    /// Final dumps, a last reconciliation and every watch joined.
    ///
    /// Returns `fatal` (or any dispatcher panic seen while stopping) so the
    /// process can exit non-zero.
    pub async fn shutdown(&mut self, fatal: Option<SyncError>) -> Result<()> {
        self.state = CerberusState::ShuttingDown;
        info!("Shutting down");

        if let Some(task) = self.reconcile_task.take() {
            if let Err(e) = task.await {
                warn!("Reconciliation task ended abnormally: {}", e);
            }
        }
        for entry in &mut self.jobs {
            if let Some(task) = entry.scheduled.take() {
                if let Err(e) = task.await {
                    warn!("Scheduled dump of {} ended abnormally: {}", entry.job.name(), e);
                }
            }
        }

        for entry in &self.jobs {
            let name = format!("shutdown_{}.sql", dump_timestamp());
            dump_and_sync(&entry.job, &entry.dumps, &name).await;
        }

        reconcile_folders(&self.all_folders()).await;

        let folders_stopped = self.folders.stop_all().await;
        let mysql_stopped = self.mysql.stop_all().await;
        self.state = CerberusState::Stopped;
        info!("All watches stopped");

        match fatal.or(folders_stopped.err()).or(mysql_stopped.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn reconcile_folders(folders: &[Arc<WatchedFolder>]) {
    let started = Instant::now();
    let failures: usize = join_all(folders.iter().map(|folder| folder.reconcile_pass()))
        .await
        .into_iter()
        .sum();
    if failures > 0 {
        warn!("Reconciliation pass finished with {} failures", failures);
    } else {
        debug!("Reconciliation pass finished in {:?}", started.elapsed());
    }
}

async fn dump_and_sync(job: &MySqlJob, dumps: &WatchedFolder, name: &str) {
    match job.create_dump(name).await {
        Ok(path) => {
            if let Err(e) = dumps.sync_path(&path).await {
                log_entity_error(&path, &e);
            }
        }
        Err(e) => error!("Dump for job {} failed: {}", job.name(), e),
    }
}
