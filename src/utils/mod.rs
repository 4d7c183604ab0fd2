pub mod config;
pub mod logging;

pub use config::{ConfigSource, JobConfig, Settings};
pub use logging::{init_tracing, LogFormat};
