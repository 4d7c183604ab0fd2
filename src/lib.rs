//! S3 files autosync
//!
//! Keeps local folders and MySQL bin-log directories in sync with S3 objects,
//! taking a remote backup before anything is overwritten.

pub mod error;
pub mod mysql;
pub mod orchestrator;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod watch;

pub use error::{Result, SyncError};
pub use orchestrator::{Cerberus, CerberusState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
