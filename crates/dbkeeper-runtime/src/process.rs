use crate::RuntimeError;
use std::fs::OpenOptions;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Command used to enumerate processes for the shutdown reaper.
pub const PROCESS_LIST_COMMAND: &str = "ps --no-headers -eo pid,ppid,cmd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Exists,
    Terminate,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Exists => 0,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

fn to_raw_pid(pid: u32) -> Result<libc::pid_t, RuntimeError> {
    libc::pid_t::try_from(pid).map_err(|_| RuntimeError::InvalidPid(pid))
}

fn raw_kill(target: libc::pid_t, signal: Signal) -> Result<(), std::io::Error> {
    // SAFETY: kill() has no memory-safety preconditions; callers pass a
    // pid obtained from i32::try_from and a valid signal number.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(target, signal.raw()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Whether `pid` names a live process.
///
/// "No such process" means dead. "Permission denied" means alive: an
/// unprivileged poller cannot signal a privileged worker, but the worker
/// exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = to_raw_pid(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match raw_kill(raw, Signal::Exists) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// Send `signal` to `pid`. Returns `Ok(false)` when the process was already
/// gone.
pub fn send_signal(pid: u32, signal: Signal) -> Result<bool, RuntimeError> {
    let raw = to_raw_pid(pid)?;
    if raw <= 0 {
        return Err(RuntimeError::InvalidPid(pid));
    }
    match raw_kill(raw, signal) {
        Ok(()) => {
            debug!("sent {signal:?} to pid {pid}");
            Ok(true)
        }
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(false),
        Err(e) => Err(RuntimeError::SignalFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// Kill every process in the group led by `pgid`.
pub(crate) fn kill_group(pgid: u32) {
    if let Ok(raw) = to_raw_pid(pgid) {
        if raw > 0 {
            let _ = raw_kill(-raw, Signal::Kill);
        }
    }
}

/// Shell-style exit code: the real code, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub cmd: String,
}

/// Parse `ps --no-headers -eo pid,ppid,cmd` output. Lines that do not have
/// the three columns are skipped.
pub fn parse_process_table(raw: &str) -> Vec<ProcessEntry> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            let cmd = parts.collect::<Vec<_>>().join(" ");
            if cmd.is_empty() {
                return None;
            }
            Some(ProcessEntry { pid, ppid, cmd })
        })
        .collect()
}

/// A command to run as a detached background worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// stdout and stderr are appended here.
    pub log_path: PathBuf,
}

/// Handle on a background worker process, possibly started by another
/// invocation. Only the pid is known, so liveness and termination go through
/// signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pid: u32,
}

impl JobHandle {
    pub fn from_pid(pid: u32) -> Self {
        Self { pid }
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Force-terminate the worker. `Ok(false)` if it had already exited.
    pub fn terminate(&self) -> Result<bool, RuntimeError> {
        send_signal(self.pid, Signal::Kill)
    }

    /// Start `cmd` in its own process group with output appended to its log.
    ///
    /// The child is not waited on; it outlives the caller.
    pub fn spawn_detached(cmd: &DetachedCommand) -> Result<Self, RuntimeError> {
        if let Some(parent) = cmd.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cmd.log_path)?;
        let log_err = log.try_clone()?;
        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| {
                RuntimeError::ExecFailed(format!(
                    "failed to spawn {}: {e}",
                    cmd.program.display()
                ))
            })?;
        debug!("spawned detached worker pid {}", child.id());
        Ok(Self { pid: child.id() })
    }
}

/// Seam for starting detached workers, so job runners can be tested without
/// forking.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, cmd: &DetachedCommand) -> Result<JobHandle, RuntimeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSpawner;

impl WorkerSpawner for DetachedSpawner {
    fn spawn(&self, cmd: &DetachedCommand) -> Result<JobHandle, RuntimeError> {
        JobHandle::spawn_detached(cmd)
    }
}
