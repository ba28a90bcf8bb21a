use crate::concurrency::shutdown_requested;
use crate::config::{uid_for_logic_id, KeeperConfig, StorageType};
use crate::install::Installer;
use crate::lifecycle::{classify_exit, validate_transition, ExitDisposition, SupervisorState};
use crate::CoreError;
use dbkeeper_runtime::{AccountManager, CommandRunner, EngineChild, EngineControl, EngineLauncher};
use dbkeeper_store::{IdentityStore, InstanceLayout, MarkerFile};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ENGINE_CONF_FILES: [&str; 2] = ["postgresql.auto.conf", "postgresql.conf"];
const PRELOAD_SETTING: &str = "shared_preload_libraries";
/// `postmaster.pid` carries the server status on its eighth line.
const PID_FILE_STATUS_LINES: usize = 8;
const READY_STATUS: &str = "ready";
const HEARTBEAT_POLLS: u64 = 60;
const DAEMON_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one supervision pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Loop again: wait for installation and unlock, then relaunch.
    Continue,
    /// Supervision is over; exit with this code.
    Exit(i32),
}

/// Put `LD_PRELOAD=<library>` in front of every binary under `prefix`.
pub fn inject_preload(command: &str, prefix: &str, library: &Path) -> String {
    if prefix.is_empty() {
        return command.to_owned();
    }
    command.replace(prefix, &format!("LD_PRELOAD={} {prefix}", library.display()))
}

fn last_preload_setting(conf: &str) -> Option<&str> {
    conf.lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with(PRELOAD_SETTING))
}

/// Whether the effective `shared_preload_libraries` line names `tool`.
/// `postgresql.auto.conf` wins over `postgresql.conf`.
pub fn preload_configured(data_dir: &Path, tool: &str) -> Result<bool, CoreError> {
    for name in ENGINE_CONF_FILES {
        let conf = match fs::read_to_string(data_dir.join(name)) {
            Ok(conf) => conf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(line) = last_preload_setting(&conf) {
            return Ok(line.contains(tool));
        }
    }
    Ok(false)
}

fn engine_ready(pid_file: &Path) -> bool {
    let Ok(content) = fs::read_to_string(pid_file) else {
        return false;
    };
    let lines: Vec<&str> = content.lines().collect();
    lines.len() >= PID_FILE_STATUS_LINES
        && lines.last().is_some_and(|l| l.trim() == READY_STATUS)
}

/// Launches the engine and decides, on every exit, whether to park, wait for
/// an externally started engine, relaunch, or end supervision.
pub struct Supervisor<'a> {
    config: &'a KeeperConfig,
    layout: InstanceLayout,
    installer: Installer<'a>,
    engine: &'a dyn EngineControl,
    launcher: &'a dyn EngineLauncher,
    accounts: &'a dyn AccountManager,
    runner: &'a dyn CommandRunner,
    start_command: String,
    stop_lock: MarkerFile,
    identity: IdentityStore,
    state: SupervisorState,
    poll_interval: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        config: &'a KeeperConfig,
        installer: Installer<'a>,
        engine: &'a dyn EngineControl,
        launcher: &'a dyn EngineLauncher,
        accounts: &'a dyn AccountManager,
        runner: &'a dyn CommandRunner,
        start_command: impl Into<String>,
    ) -> Self {
        let layout = config.layout();
        Self {
            config,
            stop_lock: MarkerFile::new(layout.stop_lock()),
            identity: IdentityStore::new(&layout),
            layout,
            installer,
            engine,
            launcher,
            accounts,
            runner,
            start_command: start_command.into(),
            state: SupervisorState::Reconciling,
            poll_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Supervise until the engine exits for good, returning its exit code.
    pub fn run(&mut self) -> Result<i32, CoreError> {
        loop {
            match self.run_once() {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Exit(code)) => return Ok(code),
                Err(e) => {
                    error!("supervision failed in state {}: {e}", self.state);
                    return Err(e);
                }
            }
        }
    }

    pub fn run_once(&mut self) -> Result<Cycle, CoreError> {
        self.enter(SupervisorState::Installing)?;
        self.installer.await_completion()?;

        self.enter(SupervisorState::Locked)?;
        self.await_unlock()?;

        self.enter(SupervisorState::Launching)?;
        self.prepare_launch()?;
        let command = self.launch_command()?;
        info!("launching engine");
        debug!("start command: {command}");
        let child = self.launcher.launch(&command)?;

        self.enter(SupervisorState::Running)?;
        let code = self.watch(child)?;

        self.enter(SupervisorState::Reconciling)?;
        let lock_held = self.stop_lock.is_held();
        let engine_live = !lock_held && self.engine.is_running();
        match classify_exit(lock_held, engine_live, code) {
            ExitDisposition::Park => {
                info!("engine exited with {code} under stop lock, parking");
                Ok(Cycle::Continue)
            }
            ExitDisposition::AwaitExternal => {
                info!("engine exited with {code} but an instance is still running, waiting for it");
                self.await_external_exit()?;
                Ok(Cycle::Continue)
            }
            ExitDisposition::Relaunch => {
                info!("engine exited cleanly without a stop lock, relaunching");
                Ok(Cycle::Continue)
            }
            ExitDisposition::Terminate(code) => {
                warn!("engine exited with {code}, supervision ends");
                Ok(Cycle::Exit(code))
            }
        }
    }

    fn enter(&mut self, next: SupervisorState) -> Result<(), CoreError> {
        validate_transition(self.state, next)?;
        debug!("supervisor {} -> {next}", self.state);
        self.state = next;
        Ok(())
    }

    fn await_unlock(&self) -> Result<(), CoreError> {
        let mut polls: u64 = 0;
        while self.stop_lock.is_held() {
            if shutdown_requested() {
                return Err(CoreError::Interrupted("waiting for unlock".to_owned()));
            }
            if polls % HEARTBEAT_POLLS == 0 {
                info!("instance is locked, waiting for unlock");
            }
            polls += 1;
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    fn await_external_exit(&self) -> Result<(), CoreError> {
        while self.engine.is_running() {
            if shutdown_requested() {
                return Err(CoreError::Interrupted(
                    "waiting for external engine".to_owned(),
                ));
            }
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// OS identity and storage checks that must hold before every launch.
    fn prepare_launch(&self) -> Result<(), CoreError> {
        let logic_id = self.identity.read_logic_id()?.ok_or_else(|| {
            CoreError::MissingState(format!(
                "{} is missing",
                self.layout.logic_id().display()
            ))
        })?;
        let user = &self.config.engine.user;
        self.accounts
            .ensure_user(user, uid_for_logic_id(&logic_id)?)?;
        self.accounts
            .add_to_group(user, &self.config.engine.hugepage_group)?;

        let storage_type = match self.identity.read_context()? {
            Some(ctx) => ctx.storage_type.parse::<StorageType>()?,
            None => {
                info!("no instance context, assuming {}", StorageType::default());
                StorageType::default()
            }
        };
        if storage_type.is_shared() && self.config.instance.on_shared_storage {
            self.await_storage_daemon();
        }
        Ok(())
    }

    fn await_storage_daemon(&self) {
        let cfg = &self.config.storage;
        let check = format!("pgrep -x {}", cfg.daemon);
        for attempt in 1..=cfg.daemon_attempts {
            match self.runner.run(&check, DAEMON_CHECK_TIMEOUT) {
                Ok(out) if out.success() => {
                    debug!("{} is up", cfg.daemon);
                    return;
                }
                Ok(_) => info!("{} not running yet (attempt {attempt})", cfg.daemon),
                Err(e) => warn!("could not look for {}: {e}", cfg.daemon),
            }
            std::thread::sleep(Duration::from_secs(cfg.daemon_interval_secs));
        }
        warn!("{} did not come up, launching anyway", cfg.daemon);
    }

    fn launch_command(&self) -> Result<String, CoreError> {
        let engine = &self.config.engine;
        if engine.preload_library.exists()
            && preload_configured(self.layout.data_dir(), &engine.perf_tool)?
        {
            info!("preloading {}", engine.preload_library.display());
            return Ok(inject_preload(
                &self.start_command,
                &engine.install_prefix,
                &engine.preload_library,
            ));
        }
        Ok(self.start_command.clone())
    }

    /// Wait for the child while a side thread drops the temporary hugepage
    /// group membership once the engine reports ready.
    fn watch(&self, mut child: Box<dyn EngineChild>) -> Result<i32, CoreError> {
        let exited = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| self.revoke_group_when_ready(&exited));
            let code = child.wait();
            exited.store(true, Ordering::SeqCst);
            code.map_err(CoreError::from)
        })
    }

    fn revoke_group_when_ready(&self, exited: &AtomicBool) {
        let pid_file = self.layout.engine_pid_file();
        loop {
            std::thread::sleep(self.poll_interval);
            if exited.load(Ordering::SeqCst) {
                debug!("engine exited before it became ready");
                return;
            }
            if self.engine.is_running() && engine_ready(&pid_file) {
                break;
            }
        }
        let user = &self.config.engine.user;
        let group = &self.config.engine.hugepage_group;
        match self.accounts.remove_from_group(user, group) {
            Ok(()) => info!("engine ready, removed {user} from {group}"),
            Err(e) => warn!("failed to remove {user} from {group}: {e}"),
        }
    }
}
