//! Worker process launching
//!
//! The orchestrator only sees a [`WorkerLauncher`]: run one category to
//! completion and report how it exited. [`ProcessLauncher`] re-executes the
//! current binary as `appharvest worker --category <C>`, one OS process per
//! category. On shutdown the child gets SIGTERM and a grace period to
//! checkpoint before it is killed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::WorkUnit;
use crate::error::{HarvestError, Result};

/// Environment variable carrying the orchestration run id into workers
pub const RUN_ID_ENV: &str = "HARVEST_RUN_ID";

/// How long a worker gets to flush and checkpoint after shutdown is requested
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub success: bool,
    pub code: Option<i32>,
    /// Set when the launcher stopped the worker because of shutdown
    pub interrupted: bool,
}

impl WorkerExit {
    pub fn success() -> Self {
        Self {
            success: true,
            code: Some(0),
            interrupted: false,
        }
    }

    pub fn failure(code: i32) -> Self {
        Self {
            success: false,
            code: Some(code),
            interrupted: false,
        }
    }

    pub fn interrupted() -> Self {
        Self {
            success: false,
            code: None,
            interrupted: true,
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Run the worker for `unit` until it exits or `shutdown` fires
    async fn run(&self, unit: WorkUnit, shutdown: CancellationToken) -> Result<WorkerExit>;
}

/// Launches category workers as child processes of the current binary
pub struct ProcessLauncher {
    program: PathBuf,
    memory_limit_mb: u64,
    dry_run: bool,
    grace: Duration,
    run_id: Option<Uuid>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, memory_limit_mb: u64) -> Self {
        Self {
            program: program.into(),
            memory_limit_mb,
            dry_run: false,
            grace: DEFAULT_SHUTDOWN_GRACE,
            run_id: None,
        }
    }

    /// Launcher for the running executable
    pub fn current_exe(memory_limit_mb: u64) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| HarvestError::Launch(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(program, memory_limit_mb))
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Tag every launched worker with the orchestration run id
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    fn command(&self, category: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--category")
            .arg(category)
            .arg("--memory-limit-mb")
            .arg(self.memory_limit_mb.to_string());
        if self.dry_run {
            cmd.arg("--dry-run");
        }
        if let Some(run_id) = self.run_id {
            cmd.env(RUN_ID_ENV, run_id.to_string());
        }
        cmd.env("LOG_FILE_PREFIX", format!("appharvest-worker-{category}"))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn run(&self, unit: WorkUnit, shutdown: CancellationToken) -> Result<WorkerExit> {
        let category = unit.unit_id;
        let mut child = self.command(&category).spawn().map_err(|e| {
            HarvestError::Launch(format!("failed to spawn worker for {category}: {e}"))
        })?;
        info!(category = %category, pid = child.id().unwrap_or_default(), "Worker launched");

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                Ok(WorkerExit {
                    success: status.success(),
                    code: status.code(),
                    interrupted: false,
                })
            }
            _ = shutdown.cancelled() => {
                request_stop(&child, &category).await;
                match tokio::time::timeout(self.grace, child.wait()).await {
                    Ok(status) => {
                        let status = status?;
                        info!(category = %category, code = ?status.code(), "Worker stopped");
                    },
                    Err(_) => {
                        warn!(category = %category, grace_secs = self.grace.as_secs(), "Worker did not stop in time, killing");
                        child.kill().await?;
                    },
                }
                Ok(WorkerExit::interrupted())
            }
        }
    }
}

/// Ask the child to checkpoint and exit
#[cfg(unix)]
async fn request_stop(child: &Child, category: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    match Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!(category, pid, "Sent SIGTERM to worker"),
        Ok(status) => warn!(category, pid, code = ?status.code(), "kill -TERM failed"),
        Err(e) => warn!(category, pid, error = %e, "Could not signal worker"),
    }
}

#[cfg(not(unix))]
async fn request_stop(_child: &Child, category: &str) {
    debug!(category, "No terminate signal on this platform, waiting out the grace period");
}
