use crate::config::KeeperConfig;
use crate::CoreError;
use dbkeeper_runtime::process::PROCESS_LIST_COMMAND;
use dbkeeper_runtime::{
    parse_process_table, send_signal, CommandRunner, EngineControl, ProcessEntry, Signal,
};
use dbkeeper_store::MarkerFile;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Parent pid of processes that entered the container from outside: the
/// init process itself and exec sessions. Only these are reaped.
const ROOT_PARENT_PID: u32 = 0;
const INIT_PID: u32 = 1;
const NOT_SHUTTING_DOWN: &str = "server does not shut down";
const PROCESS_LIST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Stopped,
    /// The engine went down only after the forced-cleanup script ran.
    ForcedCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Lock cleared; the supervisor launches the engine on its next pass.
    Unlocked,
    AlreadyRunning,
}

/// Processes the shutdown reaper may kill: top-level processes other than
/// init, the caller, and anything in the supervision chain.
pub fn reap_candidates<'a>(
    entries: &'a [ProcessEntry],
    own_pid: u32,
    protected: &[String],
) -> Vec<&'a ProcessEntry> {
    entries
        .iter()
        .filter(|e| e.pid != INIT_PID && e.pid != own_pid)
        .filter(|e| e.ppid == ROOT_PARENT_PID)
        .filter(|e| !protected.iter().any(|p| e.cmd.contains(p.as_str())))
        .collect()
}

/// Idempotent stop/start primitives. Engine liveness always comes from the
/// status collaborator, so these work no matter which process launched the
/// engine.
pub struct StopController<'a> {
    config: &'a KeeperConfig,
    engine: &'a dyn EngineControl,
    runner: &'a dyn CommandRunner,
    lock: MarkerFile,
    poll_interval: Duration,
    own_pid: u32,
}

impl<'a> StopController<'a> {
    pub fn new(
        config: &'a KeeperConfig,
        engine: &'a dyn EngineControl,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            config,
            engine,
            runner,
            lock: MarkerFile::new(config.layout().stop_lock()),
            poll_interval: Duration::from_secs(1),
            own_pid: std::process::id(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    /// The shutdown timeout bounds the whole call, stop command included.
    pub fn stop(&self, create_lock: bool) -> Result<StopOutcome, CoreError> {
        let started = Instant::now();
        if create_lock {
            if self.lock.try_acquire("")? {
                info!("stop lock created at {}", self.lock.path().display());
            } else {
                debug!("stop lock already present");
            }
        }

        if !self.engine.is_running() {
            info!("engine is not running, nothing to stop");
            return Ok(StopOutcome::AlreadyStopped);
        }

        let mode = self.config.shutdown.mode;
        let timeout = self.config.shutdown_timeout();
        info!("stopping engine (mode {mode}, timeout {}s)", timeout.as_secs());
        let mut forced = false;
        if let Err(e) = self.engine.stop(mode, timeout) {
            warn!("stop command failed, waiting for engine anyway: {e}");
            if e.output().is_some_and(|o| o.contains(NOT_SHUTTING_DOWN)) {
                self.run_cleanup_script();
                forced = true;
            }
        }

        let grace = Duration::from_secs(self.config.shutdown.cleanup_script_timeout_secs);
        let mut deadline = started + timeout;
        let mut escalated = false;
        while self.engine.is_running() {
            if Instant::now() >= deadline {
                if escalated {
                    return Err(CoreError::StopTimedOut(
                        timeout.as_secs() + grace.as_secs(),
                    ));
                }
                warn!("engine still running after {}s", timeout.as_secs());
                self.run_cleanup_script();
                escalated = true;
                forced = true;
                deadline = Instant::now() + grace;
            }
            std::thread::sleep(self.poll_interval);
        }
        info!("engine stopped");

        if self.config.shutdown.cleanup {
            self.reap()?;
        }

        Ok(if forced {
            StopOutcome::ForcedCleanup
        } else {
            StopOutcome::Stopped
        })
    }

    /// Clear the stop lock. Never launches the engine.
    pub fn start(&self) -> Result<StartOutcome, CoreError> {
        if self.lock.release()? {
            info!("stop lock removed");
        } else {
            debug!("stop lock was not present");
        }
        if self.engine.is_running() {
            info!("engine is already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        info!("engine will be launched by the supervisor");
        Ok(StartOutcome::Unlocked)
    }

    pub fn restart(&self) -> Result<StartOutcome, CoreError> {
        self.stop(true)?;
        self.start()
    }

    /// Stop without leaving a lock behind. The engine's clean exit makes the
    /// supervisor launch it again.
    pub fn process_cleanup(&self) -> Result<StopOutcome, CoreError> {
        self.stop(false)
    }

    fn run_cleanup_script(&self) {
        let script = &self.config.shutdown.cleanup_script;
        let timeout = Duration::from_secs(self.config.shutdown.cleanup_script_timeout_secs);
        let command = format!("sh {}", script.display());
        warn!("running forced cleanup: {command}");
        match self.runner.run(&command, timeout) {
            Ok(out) if out.success() => info!("forced cleanup finished"),
            Ok(out) => warn!(
                "forced cleanup exited with {}: {}",
                out.status,
                out.output.trim()
            ),
            Err(e) => warn!("forced cleanup could not run: {e}"),
        }
    }

    fn reap(&self) -> Result<(), CoreError> {
        let listing = self.runner.check(PROCESS_LIST_COMMAND, PROCESS_LIST_TIMEOUT)?;
        let entries = parse_process_table(&listing);
        let protected = &self.config.shutdown.protected_entrypoints;
        for entry in reap_candidates(&entries, self.own_pid, protected) {
            info!("killing leftover process {} ({})", entry.pid, entry.cmd);
            send_signal(entry.pid, Signal::Kill)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbkeeper_runtime::mock::{MockEngine, MockRunner};

    fn setup() -> (tempfile::TempDir, KeeperConfig) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KeeperConfig::default();
        config.paths.data_dir = dir.path().join("data");
        config.shutdown.timeout_secs = 0;
        config.shutdown.cleanup_script_timeout_secs = 0;
        (dir, config)
    }

    fn controller<'a>(
        config: &'a KeeperConfig,
        engine: &'a MockEngine,
        runner: &'a MockRunner,
    ) -> StopController<'a> {
        StopController::new(config, engine, runner).with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn stop_twice_is_idempotent() {
        let (_dir, config) = setup();
        let engine = MockEngine::running().stops_on_request();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);

        assert_eq!(ctl.stop(true).unwrap(), StopOutcome::Stopped);
        assert_eq!(ctl.stop(true).unwrap(), StopOutcome::AlreadyStopped);
        assert!(ctl.is_locked());
        assert!(!engine.is_running());
        assert_eq!(engine.stop_calls(), 1);
    }

    #[test]
    fn stop_without_lock_leaves_no_marker() {
        let (_dir, config) = setup();
        let engine = MockEngine::running().stops_on_request();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);
        assert_eq!(ctl.process_cleanup().unwrap(), StopOutcome::Stopped);
        assert!(!ctl.is_locked());
    }

    #[test]
    fn stuck_shutdown_triggers_cleanup_script() {
        let (_dir, mut config) = setup();
        config.shutdown.timeout_secs = 5;
        let engine = MockEngine::new(&[true, true, false]).failing_stop(NOT_SHUTTING_DOWN);
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);

        assert_eq!(ctl.stop(true).unwrap(), StopOutcome::ForcedCleanup);
        assert!(runner.called("sh /shutdown_cleanup.sh"));
    }

    #[test]
    fn other_stop_failures_still_wait_for_liveness() {
        let (_dir, mut config) = setup();
        config.shutdown.timeout_secs = 5;
        let engine = MockEngine::new(&[true, true, false]).failing_stop("permission denied");
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);

        assert_eq!(ctl.stop(true).unwrap(), StopOutcome::Stopped);
        assert!(!runner.called("shutdown_cleanup"));
    }

    #[test]
    fn engine_that_never_stops_times_out_after_escalation() {
        let (_dir, config) = setup();
        let engine = MockEngine::running();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);

        let err = ctl.stop(true).unwrap_err();
        assert!(matches!(err, CoreError::StopTimedOut(_)));
        assert!(runner.called("shutdown_cleanup"));
        assert!(ctl.is_locked());
    }

    #[test]
    fn slow_stop_command_counts_against_the_timeout() {
        let (_dir, mut config) = setup();
        config.shutdown.timeout_secs = 1;
        let engine = MockEngine::running().slow_stop(Duration::from_secs(1));
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);

        let started = Instant::now();
        assert!(matches!(ctl.stop(true), Err(CoreError::StopTimedOut(_))));
        assert!(runner.called("shutdown_cleanup"));
        assert!(
            started.elapsed() < Duration::from_millis(1800),
            "waited {:?} on top of the stop command",
            started.elapsed()
        );
    }

    #[test]
    fn start_clears_lock_without_launching() {
        let (_dir, config) = setup();
        let engine = MockEngine::running().stops_on_request();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);

        ctl.stop(true).unwrap();
        assert_eq!(ctl.start().unwrap(), StartOutcome::Unlocked);
        assert!(!ctl.is_locked());
        assert!(!engine.is_running());
        assert_eq!(ctl.start().unwrap(), StartOutcome::Unlocked);
    }

    #[test]
    fn start_on_running_engine_is_noop() {
        let (_dir, config) = setup();
        let engine = MockEngine::running();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);
        assert_eq!(ctl.start().unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(engine.stop_calls(), 0);
    }

    #[test]
    fn restart_stops_then_unlocks() {
        let (_dir, config) = setup();
        let engine = MockEngine::running().stops_on_request();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);
        assert_eq!(ctl.restart().unwrap(), StartOutcome::Unlocked);
        assert_eq!(engine.stop_calls(), 1);
        assert!(!ctl.is_locked());
    }

    #[test]
    fn reap_candidates_excludes_supervision_chain() {
        let entries = parse_process_table(
            "1 0 /usr/bin/dbkeeper supervise -- /u01/polardb_pg/bin/postgres\n\
             50 0 /bin/bash\n\
             51 0 python /docker_script/supervisor.py\n\
             52 50 sleep 100\n\
             60 0 /bin/sh /init_and_pause.sh\n\
             70 0 dbkeeper stop\n",
        );
        let protected = KeeperConfig::default().shutdown.protected_entrypoints;
        let pids: Vec<u32> = reap_candidates(&entries, 70, &protected)
            .iter()
            .map(|e| e.pid)
            .collect();
        assert_eq!(pids, vec![50]);
    }

    #[test]
    fn cleanup_policy_kills_listed_orphans() {
        let (_dir, mut config) = setup();
        config.shutdown.cleanup = true;
        let mut orphan = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let runner = MockRunner::new();
        runner.respond(
            "ps --no-headers",
            0,
            &format!("1 0 init\n{} 0 sleep 30\n", orphan.id()),
        );
        let engine = MockEngine::running().stops_on_request();
        let ctl = controller(&config, &engine, &runner);

        ctl.stop(true).unwrap();
        let status = orphan.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn cleanup_policy_skipped_when_already_stopped() {
        let (_dir, mut config) = setup();
        config.shutdown.cleanup = true;
        let engine = MockEngine::stopped();
        let runner = MockRunner::new();
        let ctl = controller(&config, &engine, &runner);
        ctl.stop(true).unwrap();
        assert!(runner.calls().is_empty());
    }
}
