//! Produces `.sql` dumps, live from the server or rebuilt from bin-log segments.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::tool::DumpTool;
use super::ConnectionSpec;
use crate::error::{bounded, Result, SyncError};

/// `YYYY-mm-dd_HH-MM-SS` in UTC, used in every dump file name
pub fn dump_timestamp() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

pub struct BinlogConsolidator {
    connection: ConnectionSpec,
    binlog_root: PathBuf,
    dumps_path: PathBuf,
    index_regex: Regex,
    index_file_name: Option<String>,
    tool: Arc<dyn DumpTool>,
    timeout: Option<Duration>,
}

impl BinlogConsolidator {
    pub fn new(
        connection: ConnectionSpec,
        binlog_root: PathBuf,
        dumps_path: PathBuf,
        index_regex: Regex,
        index_file_name: Option<String>,
        tool: Arc<dyn DumpTool>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            connection,
            binlog_root,
            dumps_path,
            index_regex,
            index_file_name,
            tool,
            timeout,
        }
    }

    pub fn dumps_path(&self) -> &Path {
        &self.dumps_path
    }

    /// Writes `dumps_path/name` from a live dump, or from the bin-logs when
    /// the live dump fails. Returns the file actually written.
    pub async fn create_dump(&self, name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dumps_path).await?;
        let destination = self.dumps_path.join(name);

        match self.dump_live(&destination).await {
            Ok(()) => {
                info!("Created dump {}", destination.display());
                return Ok(destination);
            }
            Err(e) => {
                warn!("Live dump {} failed: {}", name, e);
                warn!("Creating .sql file from the bin-log index instead");
            }
        }

        let fallback = self
            .dumps_path
            .join(format!("from-binary-files_{}.sql", dump_timestamp()));
        let index_file = self.find_index_file().ok_or_else(|| {
            SyncError::not_found(format!("bin-log index file under {}", self.binlog_root.display()))
        })?;
        debug!("Found index file {}", index_file.display());

        match self.consolidate_from_index(&index_file, &fallback).await {
            Ok(segments) => {
                info!(
                    "{} creation complete from {} segments",
                    fallback.display(),
                    segments
                );
                Ok(fallback)
            }
            Err(e) => {
                error!("Fallback dump from {} failed: {}", index_file.display(), e);
                Err(e)
            }
        }
    }

    async fn dump_live(&self, destination: &Path) -> Result<()> {
        let command = self.connection.dump_command();
        let output = bounded(self.timeout, self.tool.run(&command)).await?;
        if !output.success() {
            return Err(SyncError::tool(
                &command.program,
                format!("exit code {}: {}", output.exit_code, output.stderr_lossy()),
            ));
        }

        let mut temp = temp_beside(destination)?;
        temp.write_all(&output.stdout)?;
        persist(temp, destination)
    }

    /// Replays every segment named in `index_file` into `destination`, in
    /// index order. Returns the number of segments consolidated.
    pub async fn consolidate_from_index(&self, index_file: &Path, destination: &Path) -> Result<usize> {
        let contents = tokio::fs::read_to_string(index_file).await?;
        let segments = resolve_segments(index_file, &contents);
        debug!("Bin-log segments from {}: {:?}", index_file.display(), segments);

        let mut temp = temp_beside(destination)?;
        for segment in &segments {
            let command = self.connection.binlog_command(segment);
            let output = bounded(self.timeout, self.tool.run(&command)).await?;
            if !output.success() {
                return Err(SyncError::tool(
                    &command.program,
                    format!(
                        "{} exit code {}: {}",
                        segment.display(),
                        output.exit_code,
                        output.stderr_lossy()
                    ),
                ));
            }
            temp.write_all(&output.stdout)?;
        }

        persist(temp, destination)?;
        Ok(segments.len())
    }

    /// The most recently modified index file below the bin-log root
    pub fn find_index_file(&self) -> Option<PathBuf> {
        WalkDir::new(&self.binlog_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                self.index_file_name.as_deref() == Some(&*name) || self.index_regex.is_match(&name)
            })
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((modified, e.into_path()))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, path)| path)
    }
}

/// Existing segment paths listed in an index file.
///
/// Relative lines are taken relative to the index file's directory. A line
/// that does not exist there is looked up by base name next to the index
/// file. Entries found in neither place are skipped.
pub fn resolve_segments(index_file: &Path, contents: &str) -> Vec<PathBuf> {
    let index_dir = index_file.parent().unwrap_or_else(|| Path::new("."));
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let listed = Path::new(line);
            let as_listed = if listed.is_absolute() {
                listed.to_path_buf()
            } else {
                index_dir.join(listed)
            };
            if as_listed.exists() {
                return Some(as_listed);
            }
            let beside = index_dir.join(as_listed.file_name()?);
            beside.exists().then_some(beside)
        })
        .collect()
}

fn temp_beside(destination: &Path) -> Result<NamedTempFile> {
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    Ok(tempfile::Builder::new()
        .prefix(".dump-")
        .suffix(".partial")
        .tempfile_in(dir)?)
}

fn persist(temp: NamedTempFile, destination: &Path) -> Result<()> {
    temp.persist(destination).map_err(|e| SyncError::Io(e.error))?;
    Ok(())
}
