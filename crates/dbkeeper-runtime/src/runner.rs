use crate::process::{exit_code, kill_group};
use crate::RuntimeError;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Status reported for a command killed at its deadline.
pub const TIMEOUT_STATUS: i32 = -9;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

const POLL_START: Duration = Duration::from_millis(100);
const POLL_CAP: Duration = Duration::from_secs(1);

/// POSIX single-quoting for safe interpolation into `sh -c` strings.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    /// stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn new(status: i32, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn timed_out(&self) -> bool {
        self.status == TIMEOUT_STATUS
    }
}

/// Turn a non-zero (or timed out) result into `RuntimeError::CommandFailed`.
pub fn ensure_success(command: &str, out: CommandOutput) -> Result<String, RuntimeError> {
    if out.success() {
        Ok(out.output)
    } else {
        Err(RuntimeError::CommandFailed {
            command: command.to_owned(),
            status: out.status,
            output: out.output.trim().to_owned(),
        })
    }
}

/// Runs a shell command line to completion or to its deadline.
///
/// A timeout is not an `Err`: it yields `TIMEOUT_STATUS` so callers see a
/// failed command, never a hang.
pub trait CommandRunner: Send + Sync {
    fn run_with_env(
        &self,
        command: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError>;

    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        self.run_with_env(command, &[], timeout)
    }

    /// Run and require exit status 0, returning the captured output.
    fn check(&self, command: &str, timeout: Duration) -> Result<String, RuntimeError> {
        let out = self.run(command, timeout)?;
        ensure_success(command, out)
    }

    fn check_with_env(
        &self,
        command: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<String, RuntimeError> {
        let out = self.run_with_env(command, env, timeout)?;
        ensure_success(command, out)
    }
}

/// `sh -c` based runner. The command runs in its own process group so that a
/// timeout kills the whole pipeline, not just the shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: PathBuf,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl CommandRunner for ShellRunner {
    fn run_with_env(
        &self,
        command: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        debug!("exec: {command}");
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to spawn shell: {e}")))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let mut interval = POLL_START;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            thread::sleep(interval.min(deadline - now));
            interval = (interval * 2).min(POLL_CAP);
        };

        let code = if let Some(status) = status {
            exit_code(status)
        } else {
            warn!("command timed out after {}s: {command}", timeout.as_secs());
            kill_group(child.id());
            let _ = child.kill();
            let _ = child.wait();
            TIMEOUT_STATUS
        };

        let mut output = stdout.join().unwrap_or_default();
        output.extend(stderr.join().unwrap_or_default());
        Ok(CommandOutput::new(
            code,
            String::from_utf8_lossy(&output).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("hello"), "'hello'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_quote_prevents_injection() {
        let quoted = shell_quote("$(rm -rf /)");
        assert_eq!(quoted, "'$(rm -rf /)'");
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = ShellRunner::new()
            .run("echo out; echo err >&2", Duration::from_secs(5))
            .unwrap();
        assert!(out.success());
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[test]
    fn reports_exit_status() {
        let out = ShellRunner::new()
            .run("exit 3", Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.status, 3);
    }

    #[test]
    fn passes_environment() {
        let env = vec![("DBK_TEST_VALUE".to_owned(), "secret".to_owned())];
        let out = ShellRunner::new()
            .run_with_env("printf %s \"$DBK_TEST_VALUE\"", &env, Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.output, "secret");
    }

    #[test]
    fn timeout_reports_sentinel_status() {
        let start = Instant::now();
        let out = ShellRunner::new()
            .run("sleep 30; echo never", Duration::from_millis(300))
            .unwrap();
        assert!(out.timed_out());
        assert!(!out.output.contains("never"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn check_converts_failure_to_error() {
        let err = ShellRunner::new()
            .check("echo boom; exit 2", Duration::from_secs(5))
            .unwrap_err();
        match err {
            RuntimeError::CommandFailed {
                status, output, ..
            } => {
                assert_eq!(status, 2);
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn check_timeout_is_command_failure() {
        let err = ShellRunner::new()
            .check("sleep 30", Duration::from_millis(200))
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
