use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use s3_autosync::mysql::{tool::check_tool, DumpTool, ProcessDumpTool};
use s3_autosync::storage::SessionFactory;
use s3_autosync::utils::config::{load_job_config, ConfigSource, DEFAULT_CONFIG_ENV_VAR};
use s3_autosync::utils::{init_tracing, LogFormat, Settings};
use s3_autosync::{Cerberus, VERSION};

#[derive(Parser, Debug)]
#[command(name = "s3-files-autosync", version = VERSION)]
#[command(about = "Watches local folders and keeps them in sync with AWS S3")]
struct Cli {
    /// Path to the job configuration file (YAML or JSON)
    #[arg(short = 'f', long, conflicts_with = "from_env_var")]
    from_file: Option<PathBuf>,

    /// Environment variable holding the job configuration
    #[arg(short = 'e', long)]
    from_env_var: Option<String>,

    #[arg(long, value_enum, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

impl Cli {
    fn source(&self) -> ConfigSource {
        match (&self.from_file, &self.from_env_var) {
            (Some(path), _) => ConfigSource::File(path.clone()),
            (None, Some(var)) => ConfigSource::EnvVar(var.clone()),
            (None, None) => ConfigSource::EnvVar(DEFAULT_CONFIG_ENV_VAR.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_job_config(&cli.source()).context("Failed to load job configuration")?;
    let settings = Settings::load(config.settings.as_ref()).context("Failed to load settings")?;

    info!("Starting s3-files-autosync v{}", VERSION);
    info!(
        "{} folders, {} MySQL jobs, poll every {:?}",
        config.folders.len(),
        config.mysql_db.len(),
        settings.poll_interval
    );

    let tool: Arc<dyn DumpTool> = Arc::new(ProcessDumpTool);
    if !config.mysql_db.is_empty() {
        for program in ["mysqldump", "mysqlbinlog"] {
            match check_tool(tool.as_ref(), program).await {
                Ok(version) => info!("Found {}", version),
                Err(e) => warn!("{} unavailable, dumps will fail: {}", program, e),
            }
        }
    }

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let sessions = SessionFactory::from_env().await;
    let cerberus = Cerberus::build(&config, settings, &sessions, tool)
        .await
        .context("Failed to initialize watches")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    if let Err(e) = cerberus.run(shutdown).await {
        error!("Stopped after fatal error: {}", e);
        return Err(e.into());
    }

    info!("Stopped gracefully");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    token.cancel();
}
