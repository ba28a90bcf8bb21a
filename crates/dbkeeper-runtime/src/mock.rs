//! In-memory collaborators for exercising the lifecycle logic without a
//! database engine, root privileges, or real child processes.

use crate::accounts::AccountManager;
use crate::engine::{EngineControl, ShutdownMode};
use crate::launcher::{EngineChild, EngineLauncher};
use crate::process::{DetachedCommand, JobHandle, WorkerSpawner};
use crate::runner::{CommandOutput, CommandRunner};
use crate::sql::{ConnectionParams, SqlExecutor};
use crate::RuntimeError;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, RuntimeError> {
    m.lock()
        .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
}

/// Scripted `CommandRunner`. The first rule whose pattern occurs in the
/// command decides the result; unmatched commands succeed with no output.
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
    envs: Mutex<Vec<Vec<(String, String)>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, status: i32, output: &str) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((pattern.to_owned(), CommandOutput::new(status, output)));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.envs.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn called(&self, pattern: &str) -> bool {
        self.calls().iter().any(|c| c.contains(pattern))
    }
}

impl CommandRunner for MockRunner {
    fn run_with_env(
        &self,
        command: &str,
        env: &[(String, String)],
        _timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        lock(&self.calls)?.push(command.to_owned());
        lock(&self.envs)?.push(env.to_vec());
        let rules = lock(&self.rules)?;
        Ok(rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map_or_else(|| CommandOutput::new(0, ""), |(_, out)| out.clone()))
    }
}

/// Scripted engine liveness. Each liveness check consumes one entry of the sequence;
/// the last entry repeats forever.
pub struct MockEngine {
    liveness: Mutex<VecDeque<bool>>,
    stop_calls: AtomicUsize,
    stop_error: Mutex<Option<String>>,
    stop_clears_liveness: bool,
    stop_delay: Duration,
}

impl MockEngine {
    pub fn new(liveness: &[bool]) -> Self {
        Self {
            liveness: Mutex::new(liveness.iter().copied().collect()),
            stop_calls: AtomicUsize::new(0),
            stop_error: Mutex::new(None),
            stop_clears_liveness: false,
            stop_delay: Duration::ZERO,
        }
    }

    pub fn stopped() -> Self {
        Self::new(&[false])
    }

    pub fn running() -> Self {
        Self::new(&[true])
    }

    /// A successful `stop` makes every later check report "not running".
    #[must_use]
    pub fn stops_on_request(mut self) -> Self {
        self.stop_clears_liveness = true;
        self
    }

    /// Make `stop` fail with this output.
    #[must_use]
    pub fn failing_stop(self, output: &str) -> Self {
        if let Ok(mut err) = self.stop_error.lock() {
            *err = Some(output.to_owned());
        }
        self
    }

    /// Make `stop` block for `delay` before answering, like a stop command
    /// that uses up its own timeout.
    #[must_use]
    pub fn slow_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl EngineControl for MockEngine {
    fn is_running(&self) -> bool {
        let Ok(mut seq) = self.liveness.lock() else {
            return false;
        };
        if seq.len() > 1 {
            seq.pop_front().unwrap_or(false)
        } else {
            seq.front().copied().unwrap_or(false)
        }
    }

    fn stop(&self, mode: ShutdownMode, _timeout: Duration) -> Result<(), RuntimeError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.stop_delay);
        if let Some(output) = lock(&self.stop_error)?.clone() {
            return Err(RuntimeError::CommandFailed {
                command: format!("pg_ctl stop -m {mode}"),
                status: 1,
                output,
            });
        }
        if self.stop_clears_liveness {
            let mut seq = lock(&self.liveness)?;
            seq.clear();
            seq.push_back(false);
        }
        Ok(())
    }
}

type LaunchHook = Box<dyn Fn() + Send + Sync>;

/// Launcher whose children exit immediately with scripted codes. The hook
/// runs at launch time, e.g. to simulate an operator creating the stop lock
/// while the engine runs.
pub struct MockLauncher {
    exit_codes: Mutex<VecDeque<i32>>,
    launched: Mutex<Vec<String>>,
    on_launch: Option<LaunchHook>,
}

impl MockLauncher {
    pub fn new(exit_codes: &[i32]) -> Self {
        Self {
            exit_codes: Mutex::new(exit_codes.iter().copied().collect()),
            launched: Mutex::new(Vec::new()),
            on_launch: None,
        }
    }

    #[must_use]
    pub fn on_launch(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_launch = Some(Box::new(hook));
        self
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl EngineLauncher for MockLauncher {
    fn launch(&self, command: &str) -> Result<Box<dyn EngineChild>, RuntimeError> {
        lock(&self.launched)?.push(command.to_owned());
        if let Some(hook) = &self.on_launch {
            hook();
        }
        let code = lock(&self.exit_codes)?.pop_front().unwrap_or(0);
        Ok(Box::new(MockChild::new(code)))
    }
}

/// A child that has already exited with `code`.
pub struct MockChild {
    code: i32,
}

impl MockChild {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

impl EngineChild for MockChild {
    fn pid(&self) -> u32 {
        0
    }

    fn try_wait(&mut self) -> Result<Option<i32>, RuntimeError> {
        Ok(Some(self.code))
    }

    fn wait(&mut self) -> Result<i32, RuntimeError> {
        Ok(self.code)
    }
}

/// SQL collaborator returning one fixed answer.
pub struct MockSql {
    answer: Result<String, String>,
    statements: Mutex<Vec<String>>,
}

impl MockSql {
    pub fn returning(value: &str) -> Self {
        Self {
            answer: Ok(value.to_owned()),
            statements: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answer: Err(message.to_owned()),
            statements: Mutex::new(Vec::new()),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl SqlExecutor for MockSql {
    fn query_scalar(
        &self,
        _conn: &ConnectionParams,
        statement: &str,
    ) -> Result<String, RuntimeError> {
        lock(&self.statements)?.push(statement.to_owned());
        self.answer
            .clone()
            .map_err(|msg| RuntimeError::CommandFailed {
                command: "psql".to_owned(),
                status: 2,
                output: msg,
            })
    }
}

/// Records spawn requests and hands out a fixed pid.
pub struct MockSpawner {
    pid: u32,
    spawned: Mutex<Vec<DetachedCommand>>,
}

impl MockSpawner {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn spawned(&self) -> Vec<DetachedCommand> {
        self.spawned.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl WorkerSpawner for MockSpawner {
    fn spawn(&self, cmd: &DetachedCommand) -> Result<JobHandle, RuntimeError> {
        lock(&self.spawned)?.push(cmd.clone());
        Ok(JobHandle::from_pid(self.pid))
    }
}

/// Records account operations as `"op user ..."` strings.
#[derive(Default)]
pub struct MockAccounts {
    ops: Mutex<Vec<String>>,
}

impl MockAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl AccountManager for MockAccounts {
    fn ensure_user(&self, user: &str, uid: u32) -> Result<(), RuntimeError> {
        lock(&self.ops)?.push(format!("ensure {user} {uid}"));
        Ok(())
    }

    fn add_to_group(&self, user: &str, group: &str) -> Result<(), RuntimeError> {
        lock(&self.ops)?.push(format!("add {user} {group}"));
        Ok(())
    }

    fn remove_from_group(&self, user: &str, group: &str) -> Result<(), RuntimeError> {
        lock(&self.ops)?.push(format!("remove {user} {group}"));
        Ok(())
    }

    fn grant_ownership(&self, user: &str, path: &Path, mode: u32) -> Result<(), RuntimeError> {
        lock(&self.ops)?.push(format!("own {user} {} {mode:o}", path.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn runner_matches_first_rule() {
        let runner = MockRunner::new();
        runner.respond("status", 3, "stopped");
        runner.respond("sta", 0, "never");
        let out = runner.run("pg_ctl status", Duration::from_secs(1)).unwrap();
        assert_eq!(out.status, 3);
        assert!(runner
            .run("echo", Duration::from_secs(1))
            .unwrap()
            .success());
        assert!(runner.called("pg_ctl"));
    }

    #[test]
    fn engine_sequence_repeats_last() {
        let engine = MockEngine::new(&[true, true, false]);
        assert!(engine.is_running());
        assert!(engine.is_running());
        assert!(!engine.is_running());
        assert!(!engine.is_running());
    }

    #[test]
    fn engine_stop_on_request() {
        let engine = MockEngine::running().stops_on_request();
        assert!(engine.is_running());
        engine.stop(ShutdownMode::Fast, Duration::from_secs(1)).unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.stop_calls(), 1);
    }

    #[test]
    fn launcher_runs_hook_and_scripted_codes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let launcher = MockLauncher::new(&[1, 0]).on_launch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(launcher.launch("a").unwrap().wait().unwrap(), 1);
        assert_eq!(launcher.launch("b").unwrap().wait().unwrap(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.launched(), vec!["a".to_owned(), "b".to_owned()]);
    }
}
