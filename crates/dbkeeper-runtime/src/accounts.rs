use crate::runner::{shell_quote, CommandRunner};
use crate::RuntimeError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ACCOUNT_TIMEOUT: Duration = Duration::from_secs(60);

/// OS account collaborator: the engine user and its temporary group grants.
pub trait AccountManager: Send + Sync {
    fn ensure_user(&self, user: &str, uid: u32) -> Result<(), RuntimeError>;

    fn add_to_group(&self, user: &str, group: &str) -> Result<(), RuntimeError>;

    fn remove_from_group(&self, user: &str, group: &str) -> Result<(), RuntimeError>;

    /// Recursively hand `path` to `user` with permission bits `mode`.
    fn grant_ownership(&self, user: &str, path: &Path, mode: u32) -> Result<(), RuntimeError>;
}

/// Account changes through the standard shadow-utils commands.
pub struct ShellAccounts {
    runner: Arc<dyn CommandRunner>,
}

impl ShellAccounts {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl AccountManager for ShellAccounts {
    fn ensure_user(&self, user: &str, uid: u32) -> Result<(), RuntimeError> {
        let user = shell_quote(user);
        let existing = self.runner.run(&format!("id -u {user}"), ACCOUNT_TIMEOUT)?;
        if existing.success() {
            debug!("user {user} already exists (uid {})", existing.output.trim());
            return Ok(());
        }
        self.runner
            .check(&format!("useradd -m -u {uid} {user}"), ACCOUNT_TIMEOUT)?;
        Ok(())
    }

    fn add_to_group(&self, user: &str, group: &str) -> Result<(), RuntimeError> {
        self.runner.check(
            &format!("usermod -a -G {} {}", shell_quote(group), shell_quote(user)),
            ACCOUNT_TIMEOUT,
        )?;
        Ok(())
    }

    fn remove_from_group(&self, user: &str, group: &str) -> Result<(), RuntimeError> {
        self.runner.check(
            &format!("gpasswd -d {} {}", shell_quote(user), shell_quote(group)),
            ACCOUNT_TIMEOUT,
        )?;
        Ok(())
    }

    fn grant_ownership(&self, user: &str, path: &Path, mode: u32) -> Result<(), RuntimeError> {
        let path = shell_quote(&path.display().to_string());
        self.runner.check(
            &format!("chown -R {} {path}", shell_quote(user)),
            ACCOUNT_TIMEOUT,
        )?;
        self.runner
            .check(&format!("chmod -R {mode:o} {path}"), ACCOUNT_TIMEOUT)?;
        Ok(())
    }
}
