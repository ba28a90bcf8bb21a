use crate::runner::{shell_quote, CommandRunner};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn default_database() -> String {
    "postgres".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
}

/// Request/response SQL collaborator. No retries: a failure is returned to
/// the caller as is.
pub trait SqlExecutor: Send + Sync {
    /// Execute `statement` and return the first column of the first row.
    fn query_scalar(
        &self,
        conn: &ConnectionParams,
        statement: &str,
    ) -> Result<String, RuntimeError>;
}

/// Executes statements with the `psql` client. The password travels in the
/// child environment, never on the command line.
pub struct PsqlExecutor {
    runner: Arc<dyn CommandRunner>,
    psql: PathBuf,
    timeout: Duration,
}

impl PsqlExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            psql: bin_dir.into().join("psql"),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn command(&self, conn: &ConnectionParams, statement: &str) -> String {
        format!(
            "{} -At -h {} -p {} -U {} -d {} -c {}",
            self.psql.display(),
            shell_quote(&conn.host),
            conn.port,
            shell_quote(&conn.user),
            shell_quote(&conn.database),
            shell_quote(statement)
        )
    }
}

impl SqlExecutor for PsqlExecutor {
    fn query_scalar(
        &self,
        conn: &ConnectionParams,
        statement: &str,
    ) -> Result<String, RuntimeError> {
        let env = vec![("PGPASSWORD".to_owned(), conn.password.clone())];
        let out = self
            .runner
            .check_with_env(&self.command(conn, statement), &env, self.timeout)?;
        let first = out.lines().next().unwrap_or("").trim();
        if first.is_empty() {
            return Err(RuntimeError::QueryResult(format!(
                "empty result for '{statement}'"
            )));
        }
        Ok(first.split('|').next().unwrap_or(first).to_owned())
    }
}
