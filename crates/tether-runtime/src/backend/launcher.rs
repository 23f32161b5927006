//! Auto-start of the local inference service.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Starts the local service when its health probe fails.
#[async_trait]
pub trait LocalLauncher: Send + Sync {
    /// Try to start the service. `Ok(false)` means it is not installed or
    /// exited straight away.
    async fn start(&self) -> Result<bool, LaunchError>;
}

/// Launcher for installs without a local service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLauncher;

#[async_trait]
impl LocalLauncher for NoopLauncher {
    async fn start(&self) -> Result<bool, LaunchError> {
        Ok(false)
    }
}

/// Spawns a detached command such as `ollama serve`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    settle: Duration,
}

impl CommandLauncher {
    /// Time given to the service to bind its port before the re-probe.
    pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

    /// Parse a whitespace-separated command line. `None` if it is blank.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            settle: Self::DEFAULT_SETTLE,
        })
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl LocalLauncher for CommandLauncher {
    async fn start(&self) -> Result<bool, LaunchError> {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(program = %self.program, "Local service is not installed");
                return Ok(false);
            }
            Err(source) => {
                return Err(LaunchError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
        };

        tracing::info!(program = %self.program, pid = ?child.id(), "Started local service");
        tokio::time::sleep(self.settle).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(program = %self.program, %status, "Local service exited during startup");
                Ok(false)
            }
            Ok(None) => Ok(true),
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "Could not check local service");
                Ok(true)
            }
        }
    }
}
