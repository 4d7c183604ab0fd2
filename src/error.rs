//! Error types for the sync daemon

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for the sync daemon
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local root or remote object absent. Expected, drives the initial-sync branches.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Object store error: {0}")]
    Transport(String),

    #[error("Tool invocation failed: {program}: {message}")]
    ToolInvocation { program: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Watch handle failure on {path}: {message}")]
    WatchHandle { path: PathBuf, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        SyncError::PathNotFound(what.to_string())
    }

    pub fn transport(message: impl std::fmt::Display) -> Self {
        SyncError::Transport(message.to_string())
    }

    pub fn config(message: impl std::fmt::Display) -> Self {
        SyncError::Configuration(message.to_string())
    }

    pub fn tool(program: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::ToolInvocation {
            program: program.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::PathNotFound(_))
    }

    /// Per-entity failures that are logged and retried on the next trigger
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::PathNotFound(_)
                | SyncError::Transport(_)
                | SyncError::ToolInvocation { .. }
                | SyncError::Timeout(_)
                | SyncError::Io(_)
        )
    }
}

/// Bounds `fut` by `limit` when one is configured.
pub async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SyncError::Timeout(limit))?,
        None => fut.await,
    }
}
