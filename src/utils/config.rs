use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::sync::Priority;

/// Environment variable read when no explicit source is given
pub const DEFAULT_CONFIG_ENV_VAR: &str = "FILES_CONFIG";

pub const DEFAULT_SEGMENT_REGEX: &str = r"mariadb-bin.[0-9]+$";
pub const DEFAULT_INDEX_REGEX: &str = r".*-bin.index$";
pub const DUMPS_INCLUDE_REGEX: &str = r".*.sql$";
pub const DEFAULT_DUMP_INTERVAL: &str = "15m";

/// Where the job document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    EnvVar(String),
}

/// The job document: watched folders and MySQL jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub folders: BTreeMap<String, FolderConfig>,

    #[serde(default, rename = "mysqlDb")]
    pub mysql_db: BTreeMap<String, MySqlConfig>,

    /// Daemon tuning, layered under `AUTOSYNC_*` environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    #[serde(default)]
    pub priority: Priority,

    /// Literal file names to watch
    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub whitelist_regex: Vec<String>,

    /// Exclusions win over every include rule
    #[serde(default)]
    pub blacklist_regex: Vec<String>,

    /// Create the root when it is missing at startup
    #[serde(default)]
    pub auto_create: bool,

    /// Let `priority` settle size conflicts with identical timestamps
    #[serde(default)]
    pub tie_break: bool,

    pub s3: S3Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,

    #[serde(default)]
    pub prefix_key: Option<String>,

    #[serde(default)]
    pub iam_override: Option<IamOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IamOverride {
    pub iam_role: String,

    #[serde(default)]
    pub session_name: Option<String>,

    #[serde(default)]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlConfig {
    pub bin_logs: BinLogsConfig,

    #[serde(default)]
    pub dumps: Option<DumpsConfig>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub socket_path: Option<String>,

    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinLogsConfig {
    pub path: String,

    pub folder: FolderConfig,

    #[serde(default)]
    pub segment_regex: Option<String>,

    #[serde(default)]
    pub index_regex: Option<String>,

    #[serde(default)]
    pub index_file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpsConfig {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub folder: Option<FolderConfig>,

    #[serde(default)]
    pub interval: Option<String>,
}

impl MySqlConfig {
    /// Dumps folder configuration, derived from the bin-log folder when not given.
    ///
    /// The derived folder only admits `.sql` files and lands under
    /// `<bin-log prefix>/<job>/dumps`.
    pub fn dumps_folder_config(&self, job_name: &str) -> FolderConfig {
        if let Some(folder) = self.dumps.as_ref().and_then(|d| d.folder.clone()) {
            return folder;
        }

        let mut folder = self.bin_logs.folder.clone();
        folder.whitelist.clear();
        folder.blacklist_regex.clear();
        folder.whitelist_regex = vec![DUMPS_INCLUDE_REGEX.to_string()];
        let prefix = match folder.s3.prefix_key.as_deref() {
            Some(prefix) => format!("{}{}/dumps", crate::storage::prefix_key(prefix), job_name),
            None => format!("{}/dumps", job_name),
        };
        folder.s3.prefix_key = Some(crate::storage::lean_path(&prefix));
        folder
    }

    pub fn dump_interval(&self) -> Result<Duration> {
        let raw = self
            .dumps
            .as_ref()
            .and_then(|d| d.interval.as_deref())
            .unwrap_or(DEFAULT_DUMP_INTERVAL);
        parse_duration("dumps.interval", raw)
    }
}

impl JobConfig {
    /// Rejects documents the daemon cannot start from
    pub fn validate(&self) -> Result<()> {
        if self.folders.is_empty() && self.mysql_db.is_empty() {
            return Err(SyncError::config(
                "configuration defines neither `folders` nor `mysqlDb`",
            ));
        }

        for (path, folder) in &self.folders {
            validate_folder(path, folder)?;
        }

        for (name, job) in &self.mysql_db {
            if job.hostname.is_none() && job.socket_path.is_none() {
                return Err(SyncError::config(format!(
                    "mysqlDb.{}: one of `hostname` or `socket_path` is required",
                    name
                )));
            }
            validate_folder(&job.bin_logs.path, &job.bin_logs.folder)?;
            if let Some(folder) = job.dumps.as_ref().and_then(|d| d.folder.as_ref()) {
                validate_folder(&format!("{} dumps", name), folder)?;
            }
            for regex in [&job.bin_logs.segment_regex, &job.bin_logs.index_regex]
                .into_iter()
                .flatten()
            {
                compile_anchored(regex)?;
            }
            job.dump_interval()?;
        }

        Ok(())
    }
}

fn validate_folder(path: &str, folder: &FolderConfig) -> Result<()> {
    if folder.s3.bucket_name.trim().is_empty() {
        return Err(SyncError::config(format!("{}: s3.bucket_name is empty", path)));
    }
    for regex in folder.whitelist_regex.iter().chain(&folder.blacklist_regex) {
        compile_anchored(regex)?;
    }
    Ok(())
}

/// Compiles `pattern` so that it only matches from the start of the name.
pub fn compile_anchored(pattern: &str) -> Result<regex::Regex> {
    regex::Regex::new(&format!("^(?:{})", pattern))
        .map_err(|e| SyncError::config(format!("invalid regex `{}`: {}", pattern, e)))
}

/// Parses the job document. YAML first, JSON when YAML rejects it.
pub fn parse_job_config(raw: &str) -> Result<JobConfig> {
    let config = match serde_yaml::from_str::<JobConfig>(raw) {
        Ok(config) => {
            debug!("Successfully loaded YAML config");
            config
        }
        Err(yaml_error) => match serde_json::from_str::<JobConfig>(raw) {
            Ok(config) => {
                debug!("Successfully loaded JSON config");
                config
            }
            Err(json_error) => {
                return Err(SyncError::config(format!(
                    "input is neither valid YAML ({}) nor JSON ({})",
                    yaml_error, json_error
                )))
            }
        },
    };
    config.validate()?;
    Ok(config)
}

pub fn load_job_config(source: &ConfigSource) -> Result<JobConfig> {
    let raw = match source {
        ConfigSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("cannot read {}: {}", path.display(), e))
        })?,
        ConfigSource::EnvVar(name) => std::env::var(name)
            .map_err(|_| SyncError::config(format!("environment variable {} is not set", name)))?,
    };
    parse_job_config(&raw)
}

/// Daemon settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Period of the supervision loop
    pub poll_interval: Duration,

    /// Period of the remote drift pass, `None` when disabled
    pub reconcile_interval: Option<Duration>,

    /// Upper bound for each object-store or dump-tool call
    pub operation_timeout: Option<Duration>,

    /// Consecutive failed restarts before a folder is disabled
    pub max_restart_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reconcile_interval: Some(Duration::from_secs(60)),
            operation_timeout: None,
            max_restart_attempts: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    poll_interval: String,
    reconcile_interval: String,
    #[serde(default)]
    operation_timeout: Option<String>,
    max_restart_attempts: u32,
}

impl Settings {
    /// Defaults, then the document's `settings` block, then `AUTOSYNC_*` variables.
    pub fn load(overrides: Option<&serde_json::Value>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("poll_interval", "1s")
            .and_then(|b| b.set_default("reconcile_interval", "60s"))
            .and_then(|b| b.set_default("max_restart_attempts", 5))
            .map_err(SyncError::config)?;

        if let Some(overrides) = overrides {
            builder = builder.add_source(File::from_str(&overrides.to_string(), FileFormat::Json));
        }

        let raw: RawSettings = builder
            .add_source(Environment::with_prefix("AUTOSYNC"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(SyncError::config)?;

        let poll_interval = parse_duration("poll_interval", &raw.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(SyncError::config("poll_interval must be greater than zero"));
        }
        let reconcile_interval = parse_duration("reconcile_interval", &raw.reconcile_interval)?;
        Ok(Self {
            poll_interval,
            reconcile_interval: (!reconcile_interval.is_zero()).then_some(reconcile_interval),
            operation_timeout: raw
                .operation_timeout
                .as_deref()
                .map(|t| parse_duration("operation_timeout", t))
                .transpose()?,
            max_restart_attempts: raw.max_restart_attempts,
        })
    }
}

fn parse_duration(field: &str, raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(raw)
        .map_err(|e| SyncError::config(format!("{}: invalid duration `{}`: {}", field, raw, e)))
}

/// Resolves `~/` and relative paths to an absolute path
pub fn resolve_path(raw: &str) -> PathBuf {
    let path = match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    };
    absolute(&path)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
