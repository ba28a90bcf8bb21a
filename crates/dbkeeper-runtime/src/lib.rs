//! Execution layer for dbkeeper.
//!
//! Everything that touches the operating system beyond plain files lives
//! here: the `CommandRunner` used for every external tool invocation, the
//! `EngineControl` liveness/stop collaborator, the `EngineLauncher` that
//! starts the supervised engine, pid/signal primitives and the `JobHandle`
//! for detached workers, the `SqlExecutor` collaborator, OS account
//! membership, and the mock implementations used by the test suites.

pub mod accounts;
pub mod engine;
pub mod launcher;
pub mod mock;
pub mod process;
pub mod runner;
pub mod sql;

pub use accounts::{AccountManager, ShellAccounts};
pub use engine::{EngineControl, PgCtl, ShutdownMode};
pub use launcher::{EngineChild, EngineLauncher, ShellLauncher};
pub use process::{
    parse_process_table, pid_alive, send_signal, DetachedCommand, DetachedSpawner, JobHandle,
    ProcessEntry, Signal, WorkerSpawner,
};
pub use runner::{shell_quote, CommandOutput, CommandRunner, ShellRunner, TIMEOUT_STATUS};
pub use sql::{ConnectionParams, PsqlExecutor, SqlExecutor};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command exited with status {status}: {command}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
    #[error("invalid pid {0}: exceeds i32 range")]
    InvalidPid(u32),
    #[error("unexpected query result: {0}")]
    QueryResult(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}

impl RuntimeError {
    /// Whether this is a command that was killed at its deadline rather than
    /// one that ran to a non-zero exit.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RuntimeError::CommandFailed { status, .. } if *status == TIMEOUT_STATUS
        )
    }

    /// Captured output of a failed command, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            RuntimeError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinguished_by_status() {
        let timed_out = RuntimeError::CommandFailed {
            command: "sleep 10".to_owned(),
            status: TIMEOUT_STATUS,
            output: String::new(),
        };
        let failed = RuntimeError::CommandFailed {
            command: "false".to_owned(),
            status: 1,
            output: String::new(),
        };
        assert!(timed_out.is_timeout());
        assert!(!failed.is_timeout());
        assert!(!RuntimeError::InvalidPid(1).is_timeout());
    }

    #[test]
    fn command_failed_display_carries_command_and_output() {
        let e = RuntimeError::CommandFailed {
            command: "pg_ctl stop".to_owned(),
            status: 1,
            output: "server does not shut down".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("pg_ctl stop"));
        assert!(msg.contains("does not shut down"));
        assert_eq!(e.output(), Some("server does not shut down"));
    }

    #[test]
    fn signal_failed_display() {
        let e = RuntimeError::SignalFailed {
            pid: 77,
            reason: "Operation not permitted".to_owned(),
        };
        assert!(e.to_string().contains("77"));
    }
}
