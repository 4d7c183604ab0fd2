use std::fmt;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

/// A program invocation. Arguments are passed verbatim, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Environment values stay out of logs
impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs external dump programs.
///
/// A program that cannot be started is an `Err`. A program that ran and
/// failed is an `Ok` with a non-zero exit code.
#[async_trait]
pub trait DumpTool: Send + Sync {
    async fn run(&self, command: &CommandLine) -> Result<ToolOutput>;
}

/// Spawns the real `mysqldump`/`mysqlbinlog` binaries
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessDumpTool;

#[async_trait]
impl DumpTool for ProcessDumpTool {
    async fn run(&self, command: &CommandLine) -> Result<ToolOutput> {
        debug!("Running {}", command);
        let output = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::tool(&command.program, e))?;

        let result = ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if !result.stderr.is_empty() {
            debug!("{} stderr: {}", command.program, result.stderr_lossy());
        }
        Ok(result)
    }
}

/// Version line of `program`, or an error when it is not installed
pub async fn check_tool(tool: &dyn DumpTool, program: &str) -> Result<String> {
    let output = tool.run(&CommandLine::new(program).arg("--version")).await?;
    if !output.success() {
        return Err(SyncError::tool(program, "not usable"));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}
