use crate::process::exit_code;
use crate::RuntimeError;
use std::path::PathBuf;
use std::process::{Child, Command};
use tracing::info;

/// The engine process a supervisor launched and is waiting on.
pub trait EngineChild: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check; `Some(code)` once the process is gone.
    fn try_wait(&mut self) -> Result<Option<i32>, RuntimeError>;

    /// Block until exit and return the shell-style exit code.
    fn wait(&mut self) -> Result<i32, RuntimeError>;
}

pub trait EngineLauncher: Send + Sync {
    fn launch(&self, command: &str) -> Result<Box<dyn EngineChild>, RuntimeError>;
}

/// Launches the start command through `sh -c`, inheriting stdio.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: PathBuf,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

struct ShellChild {
    child: Child,
}

impl EngineChild for ShellChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, RuntimeError> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn wait(&mut self) -> Result<i32, RuntimeError> {
        Ok(exit_code(self.child.wait()?))
    }
}

impl EngineLauncher for ShellLauncher {
    fn launch(&self, command: &str) -> Result<Box<dyn EngineChild>, RuntimeError> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to launch engine: {e}")))?;
        info!("engine launched as pid {}: {command}", child.id());
        Ok(Box::new(ShellChild { child }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_and_wait_returns_exit_code() {
        let mut child = ShellLauncher::new().launch("exit 7").unwrap();
        assert!(child.pid() > 0);
        assert_eq!(child.wait().unwrap(), 7);
    }

    #[test]
    fn try_wait_reports_running_then_exit() {
        let mut child = ShellLauncher::new().launch("sleep 0.3").unwrap();
        assert_eq!(child.try_wait().unwrap(), None);
        assert_eq!(child.wait().unwrap(), 0);
        assert_eq!(child.try_wait().unwrap(), Some(0));
    }
}
