use crate::runner::{shell_quote, CommandRunner};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    Smart,
    #[default]
    Fast,
    Immediate,
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownMode::Smart => write!(f, "smart"),
            ShutdownMode::Fast => write!(f, "fast"),
            ShutdownMode::Immediate => write!(f, "immediate"),
        }
    }
}

impl std::str::FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smart" => Ok(ShutdownMode::Smart),
            "fast" => Ok(ShutdownMode::Fast),
            "immediate" => Ok(ShutdownMode::Immediate),
            other => Err(format!("unknown shutdown mode '{other}'")),
        }
    }
}

/// Engine status collaborator. Liveness is always asked of the engine's
/// control tool for a data directory, never derived from a process handle,
/// so it also sees engines started by an earlier supervisor.
pub trait EngineControl: Send + Sync {
    fn is_running(&self) -> bool;

    /// Ask the engine to shut down. An `Err` carries the tool's output.
    fn stop(&self, mode: ShutdownMode, timeout: Duration) -> Result<(), RuntimeError>;
}

/// `pg_ctl` driven through a `CommandRunner`, optionally as another OS user.
pub struct PgCtl {
    runner: Arc<dyn CommandRunner>,
    user: Option<String>,
    bin_dir: PathBuf,
    data_dir: PathBuf,
    log_file: PathBuf,
    status_timeout: Duration,
}

impl PgCtl {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bin_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        log_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            user: None,
            bin_dir: bin_dir.into(),
            data_dir: data_dir.into(),
            log_file: log_file.into(),
            status_timeout: Duration::from_secs(300),
        }
    }

    /// Run every `pg_ctl` invocation through `su -l <user>`.
    #[must_use]
    pub fn as_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    #[must_use]
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    fn wrap(&self, inner: &str) -> String {
        match &self.user {
            Some(user) => format!("su -l {user} -c {}", shell_quote(inner)),
            None => inner.to_owned(),
        }
    }

    fn pg_ctl(&self) -> String {
        self.bin_dir.join("pg_ctl").display().to_string()
    }

    pub fn status_command(&self) -> String {
        self.wrap(&format!(
            "{} status -D {}",
            self.pg_ctl(),
            shell_quote(&self.data_dir.display().to_string())
        ))
    }

    pub fn stop_command(&self, mode: ShutdownMode, timeout: Duration) -> String {
        self.wrap(&format!(
            "{} stop -D {} -c -s -l {} -m {mode} -t {}",
            self.pg_ctl(),
            shell_quote(&self.data_dir.display().to_string()),
            shell_quote(&self.log_file.display().to_string()),
            timeout.as_secs()
        ))
    }
}

impl EngineControl for PgCtl {
    fn is_running(&self) -> bool {
        match self.runner.run(&self.status_command(), self.status_timeout) {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("engine status check failed: {e}");
                false
            }
        }
    }

    fn stop(&self, mode: ShutdownMode, timeout: Duration) -> Result<(), RuntimeError> {
        self.runner.check(&self.stop_command(mode, timeout), timeout)?;
        Ok(())
    }
}
