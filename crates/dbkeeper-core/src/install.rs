use crate::concurrency::shutdown_requested;
use crate::config::{
    uid_for_logic_id, ConsensusRole, InstallSource, KeeperConfig, ServiceRole, StandbyRebuild,
};
use crate::CoreError;
use dbkeeper_runtime::{AccountManager, CommandRunner, ConnectionParams};
use dbkeeper_store::{
    IdentityStore, InstallMarkers, InstallProgress, InstanceContext, InstanceLayout, MarkerFile,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const INITDB_TIMEOUT: Duration = Duration::from_secs(600);
const STEP_TIMEOUT: Duration = Duration::from_secs(180);
const HEARTBEAT_POLLS: u64 = 60;
const DATA_DIR_MODE: u32 = 0o700;
const LOG_DIR_MODE: u32 = 0o775;

/// Bootstrap variant, decided once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallRole {
    ReadWrite,
    ReadOnly,
    Standby(StandbyRebuild),
    Datamax,
    Consensus(ConsensusRole),
    Local { standby: bool },
}

impl InstallRole {
    pub fn from_config(config: &KeeperConfig) -> Self {
        if config.shared_storage() {
            return match config.instance.service_role {
                ServiceRole::ReadWrite => InstallRole::ReadWrite,
                ServiceRole::ReadOnly => InstallRole::ReadOnly,
                ServiceRole::Standby => InstallRole::Standby(config.instance.standby_rebuild),
                ServiceRole::Datamax => InstallRole::Datamax,
            };
        }
        match config.instance.consensus_role {
            Some(role) => InstallRole::Consensus(role),
            None => InstallRole::Local {
                standby: config.instance.service_role == ServiceRole::Standby,
            },
        }
    }

    fn uses_shared_storage(self) -> bool {
        !matches!(self, InstallRole::Consensus(_) | InstallRole::Local { .. })
    }
}

impl std::fmt::Display for InstallRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallRole::ReadWrite => write!(f, "read-write"),
            InstallRole::ReadOnly => write!(f, "read-only replica"),
            InstallRole::Standby(StandbyRebuild::ReadWrite) => write!(f, "standby (as read-write)"),
            InstallRole::Standby(StandbyRebuild::ReadOnly) => write!(f, "standby (as replica)"),
            InstallRole::Standby(StandbyRebuild::Backup) => write!(f, "standby (base backup)"),
            InstallRole::Datamax => write!(f, "datamax"),
            InstallRole::Consensus(ConsensusRole::Leader) => write!(f, "consensus leader"),
            InstallRole::Consensus(ConsensusRole::Follower) => write!(f, "consensus follower"),
            InstallRole::Local { standby: false } => write!(f, "local"),
            InstallRole::Local { standby: true } => write!(f, "local standby"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyComplete,
    /// Another invocation holds the in-progress marker.
    InProgressElsewhere,
    Installed,
}

/// Writes the engine's configuration files. Their format is owned by the
/// engine tooling; the installer only says what goes in.
pub trait ConfigWriter: Send + Sync {
    fn engine_conf(&self, data_dir: &Path) -> Result<(), CoreError>;

    fn set_params(&self, data_dir: &Path, params: &[(String, String)]) -> Result<(), CoreError>;

    fn access_conf(&self, data_dir: &Path, user: &str) -> Result<(), CoreError>;

    fn recovery_conf(&self, data_dir: &Path, params: &[(String, String)]) -> Result<(), CoreError>;
}

/// Copies the `*.demo` templates and appends `key = value` lines.
pub struct TemplateConfigWriter {
    template_dir: PathBuf,
}

impl TemplateConfigWriter {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
        }
    }

    fn from_template(&self, template: &str, dest: &Path) -> Result<(), CoreError> {
        let src = self.template_dir.join(template);
        if src.exists() {
            fs::copy(&src, dest)?;
        } else {
            warn!("template {} missing, starting from empty file", src.display());
            fs::write(dest, "")?;
        }
        Ok(())
    }
}

fn append_lines(path: &Path, lines: &[String]) -> Result<(), CoreError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.sync_all()?;
    Ok(())
}

fn param_lines(params: &[(String, String)]) -> Vec<String> {
    params.iter().map(|(k, v)| format!("{k} = {v}")).collect()
}

impl ConfigWriter for TemplateConfigWriter {
    fn engine_conf(&self, data_dir: &Path) -> Result<(), CoreError> {
        let dest = data_dir.join("postgresql.conf");
        if dest.exists() {
            return Ok(());
        }
        self.from_template("postgresql.conf.demo", &dest)
    }

    fn set_params(&self, data_dir: &Path, params: &[(String, String)]) -> Result<(), CoreError> {
        append_lines(&data_dir.join("postgresql.conf"), &param_lines(params))
    }

    fn access_conf(&self, data_dir: &Path, user: &str) -> Result<(), CoreError> {
        append_lines(
            &data_dir.join("pg_hba.conf"),
            &[
                format!("local all {user} trust"),
                format!("host all {user} 127.0.0.1/32 trust"),
                format!("host replication {user} 0.0.0.0/0 md5"),
                "host all all 0.0.0.0/0 md5".to_owned(),
            ],
        )
    }

    fn recovery_conf(&self, data_dir: &Path, params: &[(String, String)]) -> Result<(), CoreError> {
        let dest = data_dir.join("recovery.conf");
        self.from_template("recovery.conf.demo", &dest)?;
        append_lines(&dest, &param_lines(params))
    }
}

/// One bootstrap action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Run {
        what: &'static str,
        command: String,
        timeout: Duration,
        /// Redacted from errors and logs.
        secret: Option<String>,
    },
    EngineConf,
    Params(Vec<(String, String)>),
    AccessConf,
    RecoveryConf(Vec<(String, String)>),
}

impl Step {
    fn run(what: &'static str, command: String, timeout: Duration) -> Self {
        Step::Run {
            what,
            command,
            timeout,
            secret: None,
        }
    }
}

fn kv(key: &str, value: impl std::fmt::Display) -> (String, String) {
    (key.to_owned(), value.to_string())
}

fn dir_is_empty_except(dir: &Path, ignore: &[PathBuf]) -> Result<bool, CoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        if !ignore.contains(&entry?.path()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Remove everything inside `dir` except the paths in `keep`.
fn clear_dir(dir: &Path, keep: &[PathBuf]) -> Result<(), CoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if keep.contains(&path) {
            continue;
        }
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Releases the in-progress marker however installation ends.
struct ProgressGuard<'a> {
    markers: &'a InstallMarkers,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.markers.end() {
            warn!("failed to release install lock: {e}");
        }
    }
}

/// One-time construction of the instance's persistent state.
pub struct Installer<'a> {
    config: &'a KeeperConfig,
    layout: InstanceLayout,
    runner: &'a dyn CommandRunner,
    writer: &'a dyn ConfigWriter,
    accounts: &'a dyn AccountManager,
    markers: InstallMarkers,
    identity: IdentityStore,
    poll_interval: Duration,
}

impl<'a> Installer<'a> {
    pub fn new(
        config: &'a KeeperConfig,
        runner: &'a dyn CommandRunner,
        writer: &'a dyn ConfigWriter,
        accounts: &'a dyn AccountManager,
    ) -> Self {
        let layout = config.layout();
        Self {
            config,
            markers: InstallMarkers::new(&layout),
            identity: IdentityStore::new(&layout),
            layout,
            runner,
            writer,
            accounts,
            poll_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn progress(&self) -> Result<InstallProgress, CoreError> {
        Ok(self.markers.progress()?)
    }

    pub fn install(&self, source: InstallSource) -> Result<InstallOutcome, CoreError> {
        match self.markers.progress()? {
            InstallProgress::Complete => {
                info!("installation already complete");
                return Ok(InstallOutcome::AlreadyComplete);
            }
            InstallProgress::InProgress => {
                info!("installation in progress elsewhere, skipping");
                return Ok(InstallOutcome::InProgressElsewhere);
            }
            InstallProgress::NotStarted => {}
        }
        let logic_id = self.logic_id()?;

        if !self.markers.begin()? {
            info!("installation claimed by another invocation, skipping");
            return Ok(InstallOutcome::InProgressElsewhere);
        }
        let _guard = ProgressGuard {
            markers: &self.markers,
        };

        let result = self.run_install(source, logic_id);
        if let Err(e) = &result {
            error!("installation failed: {e}");
        }
        result.map(|()| InstallOutcome::Installed)
    }

    fn run_install(&self, source: InstallSource, logic_id: &str) -> Result<(), CoreError> {
        if source == InstallSource::Engine {
            info!("re-registering a running instance, data directory kept");
        } else {
            info!("clearing data directories");
            clear_dir(self.layout.data_dir(), &[self.layout.stop_lock()])?;
            clear_dir(self.layout.external_data_dir(), &[])?;
        }
        self.layout.initialize()?;
        self.prepare_engine_user(logic_id)?;

        if dir_is_empty_except(self.layout.data_dir(), &[self.layout.stop_lock()])?
            && dir_is_empty_except(self.layout.external_data_dir(), &[])?
        {
            let role = InstallRole::from_config(self.config);
            let storage_ready = role.uses_shared_storage() && self.shared_datadir_exists();
            info!("bootstrapping {role} instance (shared storage initialized: {storage_ready})");
            for step in self.plan(role, storage_ready)? {
                self.execute(&step)?;
            }
        } else {
            info!("data directory already populated, skipping bootstrap");
        }

        self.link_log_dir()?;
        if self.config.engine.switch_user {
            self.accounts.grant_ownership(
                &self.config.engine.user,
                &self.layout.engine_log_dir(),
                LOG_DIR_MODE,
            )?;
        }
        self.post_install(logic_id)
    }

    /// The engine user must exist and own its directories before any
    /// bootstrap command runs as that user.
    fn prepare_engine_user(&self, logic_id: &str) -> Result<(), CoreError> {
        if !self.config.engine.switch_user {
            debug!("bootstrap runs as the invoking user");
            return Ok(());
        }
        let user = &self.config.engine.user;
        self.accounts.ensure_user(user, uid_for_logic_id(logic_id)?)?;
        for dir in [
            self.layout.data_dir(),
            self.layout.log_dir(),
            self.layout.external_data_dir(),
        ] {
            self.accounts.grant_ownership(user, dir, DATA_DIR_MODE)?;
        }
        info!("{} prepared for {user}", self.layout.data_dir().display());
        Ok(())
    }

    fn logic_id(&self) -> Result<&'a str, CoreError> {
        self.config
            .instance
            .logic_ins_id
            .as_deref()
            .ok_or_else(|| CoreError::MissingState("logic_ins_id is not configured".to_owned()))
    }

    /// Block until another invocation has finished installing. No timeout of
    /// its own; an interrupt ends the wait.
    pub fn await_completion(&self) -> Result<(), CoreError> {
        let mut polls: u64 = 0;
        while !self.markers.is_complete()? {
            if shutdown_requested() {
                return Err(CoreError::Interrupted(
                    "waiting for installation".to_owned(),
                ));
            }
            polls += 1;
            if polls % HEARTBEAT_POLLS == 0 {
                info!("still waiting for installation to complete");
            }
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Rebuild a replica's local directory from shared storage, keeping the
    /// stop lock.
    pub fn rebuild_local(&self) -> Result<(), CoreError> {
        let logic_id = self.logic_id()?;
        info!("rebuilding local data directory");
        clear_dir(self.layout.data_dir(), &[self.layout.stop_lock()])?;
        self.layout.initialize()?;

        let mut steps = vec![
            self.replica_initdb(),
            Step::EngineConf,
            Step::Params(self.storage_params()),
            Step::AccessConf,
        ];
        steps.extend(self.rebuilt_recovery().map(Step::RecoveryConf));
        for step in &steps {
            self.execute(step)?;
        }
        self.link_log_dir()?;
        self.post_install(logic_id)
    }

    /// Recovery settings a rebuilt directory needs, by service role.
    fn rebuilt_recovery(&self) -> Option<Vec<(String, String)>> {
        match self.config.instance.service_role {
            ServiceRole::ReadWrite => None,
            ServiceRole::ReadOnly => Some(self.replica_recovery()),
            ServiceRole::Standby => {
                let mut params = vec![kv("standby_mode", "'on'")];
                params.extend(self.primary_conninfo());
                Some(params)
            }
            ServiceRole::Datamax => Some(vec![kv("polar_datamax_mode", "'standalone'")]),
        }
    }

    fn shared_datadir_exists(&self) -> bool {
        let check = self
            .config
            .pfs_command(&format!("stat {}", self.config.storage.datadir));
        matches!(self.runner.run(&check, STEP_TIMEOUT), Ok(out) if out.success())
    }

    fn plan(&self, role: InstallRole, storage_ready: bool) -> Result<Vec<Step>, CoreError> {
        let steps = match role {
            InstallRole::ReadWrite | InstallRole::Standby(StandbyRebuild::ReadWrite) => {
                self.read_write_plan(storage_ready, None)
            }
            InstallRole::ReadOnly | InstallRole::Standby(StandbyRebuild::ReadOnly) => vec![
                self.replica_initdb(),
                Step::EngineConf,
                Step::Params(self.storage_params()),
                Step::AccessConf,
                Step::RecoveryConf(self.replica_recovery()),
            ],
            InstallRole::Standby(StandbyRebuild::Backup) => vec![
                self.base_backup(&self.config.storage.datadir)?,
                Step::EngineConf,
                Step::Params(self.storage_params()),
            ],
            InstallRole::Datamax => {
                let sysid = self
                    .config
                    .instance
                    .primary_system_identifier
                    .as_deref()
                    .ok_or_else(|| {
                        CoreError::Config("datamax requires primary_system_identifier".to_owned())
                    })?;
                let mut steps = self.read_write_plan(storage_ready, Some(sysid));
                steps.push(Step::RecoveryConf(vec![kv(
                    "polar_datamax_mode",
                    "'standalone'",
                )]));
                steps
            }
            InstallRole::Consensus(ConsensusRole::Leader) => {
                let cfg = self.config;
                vec![
                    self.initdb(None),
                    Step::run(
                        "polar-initdb (localfs)",
                        cfg.as_engine_user(&format!(
                            "{}/polar-initdb.sh {}/ {}/ localfs",
                            cfg.engine.bin_dir.display(),
                            self.layout.data_dir().display(),
                            self.layout.external_data_dir().display()
                        )),
                        STEP_TIMEOUT,
                    ),
                    Step::EngineConf,
                    Step::Params(vec![
                        kv("polar_enable_shared_storage_mode", "on"),
                        kv("polar_vfs.localfs_test_mode", "on"),
                        kv("polar_hostid", cfg.storage.host_id),
                        kv(
                            "polar_datadir",
                            format!(
                                "'file-dio://{}'",
                                self.layout.external_data_dir().display()
                            ),
                        ),
                    ]),
                    Step::AccessConf,
                    self.consensus_meta(ConsensusRole::Leader),
                ]
            }
            InstallRole::Consensus(ConsensusRole::Follower) => {
                let polardata = self.layout.external_data_dir().display().to_string();
                vec![
                    self.base_backup(&polardata)?,
                    self.consensus_meta(ConsensusRole::Follower),
                ]
            }
            InstallRole::Local { standby } => {
                let mut steps = vec![self.initdb(None), Step::EngineConf, Step::AccessConf];
                if standby {
                    let mut params = vec![kv("standby_mode", "'on'")];
                    params.extend(self.primary_conninfo());
                    steps.push(Step::RecoveryConf(params));
                }
                steps
            }
        };
        Ok(steps)
    }

    fn read_write_plan(&self, storage_ready: bool, sysid: Option<&str>) -> Vec<Step> {
        let mut steps = if storage_ready {
            vec![self.replica_initdb()]
        } else {
            vec![self.initdb(sysid)]
        };
        steps.push(Step::EngineConf);
        steps.push(Step::Params(self.storage_params()));
        steps.push(Step::AccessConf);
        if !storage_ready {
            steps.push(self.push_to_shared_storage());
        }
        steps
    }

    fn initdb(&self, sysid: Option<&str>) -> Step {
        let cfg = self.config;
        let mut command = format!(
            "{}/initdb --username={} {} -D {}",
            cfg.engine.bin_dir.display(),
            cfg.engine.user,
            cfg.engine.initdb_args,
            self.layout.data_dir().display()
        );
        if let Some(sysid) = sysid {
            command.push_str(&format!(" -i {sysid}"));
        }
        Step::run("initdb", cfg.as_engine_user(&command), INITDB_TIMEOUT)
    }

    fn replica_initdb(&self) -> Step {
        let cfg = self.config;
        Step::run(
            "polar-replica-initdb",
            cfg.as_engine_user(&format!(
                "sh {}/polar-replica-initdb.sh {}/ {}/ {}",
                cfg.engine.bin_dir.display(),
                cfg.storage.datadir,
                self.layout.data_dir().display(),
                cfg.storage_cluster()
            )),
            STEP_TIMEOUT,
        )
    }

    fn push_to_shared_storage(&self) -> Step {
        let cfg = self.config;
        Step::run(
            "polar-initdb",
            format!(
                "sh {}/polar-initdb.sh {}/ {}/ {}",
                cfg.engine.bin_dir.display(),
                self.layout.data_dir().display(),
                cfg.storage.datadir,
                cfg.storage_cluster()
            ),
            STEP_TIMEOUT,
        )
    }

    fn primary(&self) -> Result<&'a ConnectionParams, CoreError> {
        self.config.instance.primary.as_ref().ok_or_else(|| {
            CoreError::Config("a primary endpoint is required for this role".to_owned())
        })
    }

    fn base_backup(&self, polardata: &str) -> Result<Step, CoreError> {
        let cfg = self.config;
        let primary = self.primary()?;
        let command = format!(
            "PGPASSWORD={} {}/polar_basebackup -h {} -p {} -U {} -P -R -D {} --polardata={} -X stream",
            primary.password,
            cfg.engine.bin_dir.display(),
            primary.host,
            primary.port,
            primary.user,
            self.layout.data_dir().display(),
            polardata
        );
        Ok(Step::Run {
            what: "polar_basebackup",
            command: cfg.as_engine_user(&command),
            timeout: INITDB_TIMEOUT,
            secret: (!primary.password.is_empty()).then(|| primary.password.clone()),
        })
    }

    fn consensus_meta(&self, role: ConsensusRole) -> Step {
        let cfg = self.config;
        let (key, suffix) = match role {
            ConsensusRole::Leader => ("polar_dma_members_info", "@1"),
            ConsensusRole::Follower => ("polar_dma_learners_info", ""),
        };
        Step::run(
            "consensus meta init",
            cfg.as_engine_user(&format!(
                "{}/polar-postgres -D {} -c polar_dma_init_meta=ON -c {key}=\"{}:{}{suffix}\" -p {}",
                cfg.engine.bin_dir.display(),
                self.layout.data_dir().display(),
                cfg.engine.host,
                cfg.engine.port,
                cfg.engine.port
            )),
            STEP_TIMEOUT,
        )
    }

    fn storage_params(&self) -> Vec<(String, String)> {
        let cfg = self.config;
        let mut params = vec![
            kv("port", cfg.engine.port),
            kv("polar_enable_shared_storage_mode", "on"),
            kv("polar_hostid", cfg.storage.host_id),
            kv("polar_disk_name", format!("'{}'", cfg.storage.disk_name)),
            kv("polar_datadir", format!("'{}'", cfg.storage.datadir)),
        ];
        if let Some(id) = &cfg.instance.logic_ins_id {
            params.push(kv("polar_vfs.logic_ins_id", id));
        }
        let cluster = cfg.storage_cluster();
        if !cluster.is_empty() {
            params.push(kv("polar_storage_cluster_name", format!("'{cluster}'")));
        }
        params
    }

    fn primary_conninfo(&self) -> Option<(String, String)> {
        self.config.instance.primary.as_ref().map(|p| {
            kv(
                "primary_conninfo",
                format!(
                    "'host={} port={} user={} password={}'",
                    p.host, p.port, p.user, p.password
                ),
            )
        })
    }

    fn replica_recovery(&self) -> Vec<(String, String)> {
        let mut params = vec![kv("polar_replica", "'on'"), kv("recovery_target_timeline", "'latest'")];
        params.extend(self.primary_conninfo());
        params
    }

    fn execute(&self, step: &Step) -> Result<(), CoreError> {
        let data_dir = self.layout.data_dir();
        match step {
            Step::Run {
                what,
                command,
                timeout,
                secret,
            } => {
                info!("running {what}");
                self.runner.check(command, *timeout).map_err(|e| {
                    let mut msg = format!("{what}: {e}");
                    if let Some(secret) = secret {
                        msg = msg.replace(secret.as_str(), "******");
                    }
                    CoreError::Installation(msg)
                })?;
            }
            Step::EngineConf => self.writer.engine_conf(data_dir)?,
            Step::Params(params) => self.writer.set_params(data_dir, params)?,
            Step::AccessConf => self.writer.access_conf(data_dir, &self.config.engine.user)?,
            Step::RecoveryConf(params) => self.writer.recovery_conf(data_dir, params)?,
        }
        Ok(())
    }

    /// `<data>/log` must be a symlink into the log volume.
    fn link_log_dir(&self) -> Result<(), CoreError> {
        let target = self.layout.engine_log_dir();
        let link = self.layout.engine_log_link();
        fs::create_dir_all(&target)?;
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(()),
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&link)?,
            Ok(_) => {
                warn!("{} is not a directory, leaving it", link.display());
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(&target, &link)?;
        Ok(())
    }

    fn post_install(&self, logic_id: &str) -> Result<(), CoreError> {
        if self.config.instance.lock_on_install
            && MarkerFile::new(self.layout.stop_lock()).try_acquire("")?
        {
            info!("instance locked after installation");
        }
        self.identity.write_logic_id(logic_id)?;
        self.markers.mark_complete()?;
        self.identity.write_context(&InstanceContext {
            storage_type: self.config.instance.storage_type.to_string(),
            ins_logic_id: logic_id.to_owned(),
        })?;
        info!("installation complete");
        Ok(())
    }
}
