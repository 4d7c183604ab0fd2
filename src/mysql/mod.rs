pub mod consolidator;
pub mod tool;

pub use consolidator::{dump_timestamp, BinlogConsolidator};
pub use tool::{CommandLine, DumpTool, ProcessDumpTool, ToolOutput};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use tempfile::TempDir;
use tracing::info;

use crate::error::Result;
use crate::utils::config::{
    compile_anchored, resolve_path, MySqlConfig, DEFAULT_INDEX_REGEX, DEFAULT_SEGMENT_REGEX,
};

pub const DEFAULT_PORT: u16 = 3306;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Host { hostname: String, port: u16 },
    Socket(PathBuf),
}

/// How to reach one database
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub endpoint: Endpoint,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
}

impl ConnectionSpec {
    /// Hostname wins over socket path when both are set
    pub fn from_config(config: &MySqlConfig) -> Result<Self> {
        let endpoint = match (&config.hostname, &config.socket_path) {
            (Some(hostname), _) => Endpoint::Host {
                hostname: hostname.clone(),
                port: config.port.unwrap_or(DEFAULT_PORT),
            },
            (None, Some(socket)) => Endpoint::Socket(PathBuf::from(crate::storage::lean_path(socket))),
            (None, None) => {
                return Err(crate::error::SyncError::config(
                    "one of `hostname` or `socket_path` is required",
                ))
            }
        };
        Ok(Self {
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        })
    }

    fn with_password(&self, command: CommandLine) -> CommandLine {
        match &self.password {
            Some(password) => command.env("MYSQL_PWD", password.clone()),
            None => command,
        }
    }

    /// `mysqldump` of the whole database to stdout
    pub fn dump_command(&self) -> CommandLine {
        let command = match &self.endpoint {
            Endpoint::Host { hostname, port } => CommandLine::new("mysqldump")
                .arg("--protocol=TCP")
                .arg("-h")
                .arg(hostname.clone())
                .arg("-u")
                .arg(self.username.clone())
                .arg(format!("--port={}", port)),
            Endpoint::Socket(socket) => CommandLine::new("mysqldump")
                .arg(format!("--socket={}", socket.display()))
                .arg("-u")
                .arg(self.username.clone()),
        };
        self.with_password(command.arg(self.database.clone()))
    }

    /// `mysqlbinlog` replay of one segment, restricted to the database
    pub fn binlog_command(&self, segment: &Path) -> CommandLine {
        CommandLine::new("mysqlbinlog")
            .arg("--skip-annotate-row-events")
            .arg("--short-form")
            .arg(segment.display().to_string())
            .arg("-d")
            .arg(self.database.clone())
    }
}

/// One MySQL backup job: bin-log segments plus the dumps made from them
pub struct MySqlJob {
    name: String,
    binlog_root: PathBuf,
    segment_regex: Regex,
    dump_interval: Duration,
    consolidator: BinlogConsolidator,
    last_dump: Mutex<Instant>,
    dump_lock: tokio::sync::Mutex<()>,
    // Lives as long as the job when no dumps path is configured
    _temp_dir: Option<TempDir>,
}

impl MySqlJob {
    pub fn from_config(
        name: &str,
        config: &MySqlConfig,
        tool: Arc<dyn DumpTool>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let connection = ConnectionSpec::from_config(config)?;
        let binlog_root = resolve_path(&config.bin_logs.path);

        let (dumps_path, temp_dir) = match config.dumps.as_ref().and_then(|d| d.path.as_deref()) {
            Some(path) => (resolve_path(path), None),
            None => {
                let temp_dir = tempfile::Builder::new()
                    .prefix(&format!("{}-dumps-", name))
                    .tempdir()?;
                (temp_dir.path().to_path_buf(), Some(temp_dir))
            }
        };

        let segment_regex = compile_anchored(
            config
                .bin_logs
                .segment_regex
                .as_deref()
                .unwrap_or(DEFAULT_SEGMENT_REGEX),
        )?;
        let index_regex = compile_anchored(
            config
                .bin_logs
                .index_regex
                .as_deref()
                .unwrap_or(DEFAULT_INDEX_REGEX),
        )?;

        info!(
            "MySQL job {}: bin-logs {} dumps {}",
            name,
            binlog_root.display(),
            dumps_path.display()
        );

        Ok(Self {
            name: name.to_string(),
            consolidator: BinlogConsolidator::new(
                connection,
                binlog_root.clone(),
                dumps_path,
                index_regex,
                config.bin_logs.index_file_name.clone(),
                tool,
                timeout,
            ),
            binlog_root,
            segment_regex,
            dump_interval: config.dump_interval()?,
            last_dump: Mutex::new(Instant::now()),
            dump_lock: tokio::sync::Mutex::new(()),
            _temp_dir: temp_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binlog_root(&self) -> &Path {
        &self.binlog_root
    }

    pub fn dumps_path(&self) -> &Path {
        self.consolidator.dumps_path()
    }

    pub fn consolidator(&self) -> &BinlogConsolidator {
        &self.consolidator
    }

    /// True when `file_name` looks like a bin-log segment
    pub fn is_segment(&self, file_name: &str) -> bool {
        self.segment_regex.is_match(file_name)
    }

    /// No dump was produced during the last interval
    pub fn dump_due(&self) -> bool {
        self.last_dump.lock().elapsed() >= self.dump_interval
    }

    /// Creates a dump named `name`; dumps of one job never overlap.
    ///
    /// The attempt restarts the dump interval whether or not it succeeds.
    pub async fn create_dump(&self, name: &str) -> Result<PathBuf> {
        let _guard = self.dump_lock.lock().await;
        *self.last_dump.lock() = Instant::now();
        self.consolidator.create_dump(name).await
    }
}
