use crate::CoreError;
use dbkeeper_runtime::{shell_quote, ConnectionParams, ShutdownMode};
use dbkeeper_store::layout::{DEFAULT_INSTALL_LOCK, DEFAULT_RESTORE_DIR};
use dbkeeper_store::InstanceLayout;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Role of the instance within its replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    #[default]
    #[serde(alias = "rw", alias = "polardb_mpd_rw")]
    ReadWrite,
    #[serde(alias = "ro", alias = "polardb_mpd_ro")]
    ReadOnly,
    #[serde(alias = "polardb_mpd_standby")]
    Standby,
    #[serde(alias = "polardb_mpd_datamax")]
    Datamax,
}

impl std::str::FromStr for ServiceRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readwrite" | "rw" | "polardb_mpd_rw" => Ok(ServiceRole::ReadWrite),
            "readonly" | "ro" | "polardb_mpd_ro" => Ok(ServiceRole::ReadOnly),
            "standby" | "polardb_mpd_standby" => Ok(ServiceRole::Standby),
            "datamax" | "polardb_mpd_datamax" => Ok(ServiceRole::Datamax),
            other => Err(CoreError::Config(format!("unknown service type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    #[default]
    PolarStore,
    FcSan,
}

impl StorageType {
    pub fn is_shared(self) -> bool {
        matches!(self, StorageType::PolarStore | StorageType::FcSan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::PolarStore => "polarstore",
            StorageType::FcSan => "fcsan",
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorageType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageType::Local),
            "polarstore" => Ok(StorageType::PolarStore),
            "fcsan" => Ok(StorageType::FcSan),
            other => Err(CoreError::Config(format!("unknown storage type '{other}'"))),
        }
    }
}

/// Member role in a three-node consensus group on local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusRole {
    #[serde(alias = "master")]
    Leader,
    Follower,
}

impl std::str::FromStr for ConsensusRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" | "master" => Ok(ConsensusRole::Leader),
            "follower" => Ok(ConsensusRole::Follower),
            other => Err(CoreError::Config(format!("unknown consensus role '{other}'"))),
        }
    }
}

/// How a standby on shared storage is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandbyRebuild {
    #[serde(alias = "rw")]
    ReadWrite,
    #[serde(alias = "ro")]
    ReadOnly,
    #[default]
    Backup,
}

impl std::str::FromStr for StandbyRebuild {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readwrite" | "rw" => Ok(StandbyRebuild::ReadWrite),
            "readonly" | "ro" => Ok(StandbyRebuild::ReadOnly),
            // An empty variable means unset.
            "backup" | "" => Ok(StandbyRebuild::Backup),
            other => Err(CoreError::Config(format!(
                "unknown standby rebuild type '{other}'"
            ))),
        }
    }
}

/// Who asked for the installation. `Engine` re-registers an instance that is
/// already running, so its data directory must not be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallSource {
    Engine,
    #[default]
    Manager,
}

impl std::str::FromStr for InstallSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engine" => Ok(InstallSource::Engine),
            "manager" => Ok(InstallSource::Manager),
            other => Err(CoreError::Config(format!("unknown install source '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub external_data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub install_lock: PathBuf,
    pub restore_dir: PathBuf,
    /// Directory holding `postgresql.conf.demo` and `recovery.conf.demo`.
    pub template_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            external_data_dir: PathBuf::from("/disk1"),
            log_dir: PathBuf::from("/log"),
            install_lock: PathBuf::from(DEFAULT_INSTALL_LOCK),
            restore_dir: PathBuf::from(DEFAULT_RESTORE_DIR),
            template_dir: PathBuf::from("/"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub bin_dir: PathBuf,
    /// OS user owning the data directory and running every engine tool.
    pub user: String,
    /// Wrap engine tools in `su -l <user>`; off when already running as it.
    pub switch_user: bool,
    pub initdb_args: String,
    pub port: u16,
    pub host: String,
    /// Install prefix that marks the engine binary inside the start command.
    pub install_prefix: String,
    pub preload_library: PathBuf,
    pub perf_tool: String,
    /// Group granted during startup for huge-page shared memory.
    pub hugepage_group: String,
    pub status_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("/u01/polardbmpd/bin"),
            user: "postgres".to_owned(),
            switch_user: true,
            initdb_args: "--encoding=UTF8 --no-locale --data-checksums".to_owned(),
            port: 5432,
            host: "127.0.0.1".to_owned(),
            install_prefix: "/u01/polardb_".to_owned(),
            preload_library: PathBuf::from("/usr/lib64/libjemalloc.so.2"),
            perf_tool: "polar_perf_tool".to_owned(),
            hugepage_group: "root".to_owned(),
            status_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceConfig {
    pub logic_ins_id: Option<String>,
    pub service_role: ServiceRole,
    pub storage_type: StorageType,
    /// Data lives on the shared storage mount rather than local disk.
    pub on_shared_storage: bool,
    pub consensus_role: Option<ConsensusRole>,
    pub standby_rebuild: StandbyRebuild,
    /// Create the stop lock as the last installation step.
    pub lock_on_install: bool,
    /// Replication source for replicas, standbys and consensus followers.
    pub primary: Option<ConnectionParams>,
    pub primary_system_identifier: Option<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            logic_ins_id: None,
            service_role: ServiceRole::ReadWrite,
            storage_type: StorageType::PolarStore,
            on_shared_storage: false,
            consensus_role: None,
            standby_rebuild: StandbyRebuild::Backup,
            lock_on_install: false,
            primary: None,
            primary_system_identifier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub pfs_bin: PathBuf,
    pub disk_name: String,
    pub datadir: String,
    pub cluster_name: Option<String>,
    pub host_id: u32,
    /// Process name of the storage daemon awaited before launch.
    pub daemon: String,
    pub daemon_attempts: u32,
    pub daemon_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pfs_bin: PathBuf::from("/usr/local/bin/pfs"),
            disk_name: String::new(),
            datadir: String::new(),
            cluster_name: None,
            host_id: 1,
            daemon: "pfsdaemon".to_owned(),
            daemon_attempts: 5,
            daemon_interval_secs: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub mode: ShutdownMode,
    pub timeout_secs: u64,
    /// Reap leftover processes after the engine has stopped.
    pub cleanup: bool,
    pub cleanup_script: PathBuf,
    pub cleanup_script_timeout_secs: u64,
    /// Command-line fragments of processes the reaper must never kill.
    pub protected_entrypoints: Vec<String>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::Fast,
            timeout_secs: 300,
            cleanup: false,
            cleanup_script: PathBuf::from("/shutdown_cleanup.sh"),
            cleanup_script_timeout_secs: 60,
            protected_entrypoints: vec![
                "dbkeeper supervise".to_owned(),
                "supervisor.py".to_owned(),
                "init_and_pause".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PitrConfig {
    pub source: Option<ConnectionParams>,
    pub receive_timeout_secs: u64,
    /// Must exceed the shared storage lease.
    pub copy_timeout_secs: u64,
}

impl Default for PitrConfig {
    fn default() -> Self {
        Self {
            source: None,
            receive_timeout_secs: 320,
            copy_timeout_secs: 320,
        }
    }
}

/// Immutable configuration, built once in `main` and borrowed by every
/// component. Library code never reads the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeeperConfig {
    pub paths: PathsConfig,
    pub engine: EngineConfig,
    pub instance: InstanceConfig,
    pub storage: StorageConfig,
    pub shutdown: ShutdownConfig,
    pub pitr: PitrConfig,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(CoreError::Config(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CoreError> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{key}: expected a number, got '{value}'")))
}

#[derive(Deserialize)]
struct PitrEnv {
    pitr_host: String,
    pitr_port: u16,
    pitr_user: String,
    #[serde(default)]
    pitr_password: String,
}

impl KeeperConfig {
    /// Defaults, then the optional TOML file, then the container environment.
    pub fn load(file: Option<&Path>, env: &HashMap<String, String>) -> Result<Self, CoreError> {
        let mut config = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CoreError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, CoreError> {
        toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))
    }

    #[allow(clippy::too_many_lines)]
    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), CoreError> {
        let get = |key: &str| env.get(key).map(String::as_str).filter(|v| !v.is_empty());

        if let Some(v) = get("PG_DATA") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PG_EXTERNAL_DATA") {
            self.paths.external_data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PG_LOG") {
            self.paths.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PG_SET_INSTALL_STEP_LOCK") {
            self.paths.install_lock = PathBuf::from(v);
        }
        if let Some(v) = get("RESTORE_DIR") {
            self.paths.restore_dir = PathBuf::from(v);
        }
        if let Some(v) = get("POLARDB_BASE_DIR") {
            self.engine.bin_dir = Path::new(v).join("bin");
        }
        if let Some(v) = get("INITDB_SUPERUSER") {
            self.engine.user = v.to_owned();
        }
        if let Some(v) = get("logic_ins_id") {
            self.instance.logic_ins_id = Some(v.to_owned());
        }
        if let Some(v) = get("service_type") {
            self.instance.service_role = v.parse()?;
        }
        if let Some(v) = get("storage_type") {
            self.instance.storage_type = v.parse()?;
        }
        if let Some(v) = get("on_pfs") {
            self.instance.on_shared_storage = parse_bool("on_pfs", v)?;
        }
        if let Some(v) = get("dma_role") {
            self.instance.consensus_role = Some(v.parse()?);
        }
        if let Some(v) = get("standby_rebuild_type") {
            self.instance.standby_rebuild = v.parse()?;
        }
        if let Some(v) = get("lock_install_ins") {
            self.instance.lock_on_install = parse_bool("lock_install_ins", v)?;
        }
        if let Some(v) = get("primary_system_identifier") {
            self.instance.primary_system_identifier = Some(v.to_owned());
        }
        if let Some(host) = get("primary_host") {
            let port = get("primary_port").map_or(Ok(5432), |p| parse_num("primary_port", p))?;
            self.instance.primary = Some(ConnectionParams {
                host: host.to_owned(),
                port,
                user: get("repl_user").unwrap_or("replicator").to_owned(),
                password: get("repl_password").unwrap_or_default().to_owned(),
                database: "postgres".to_owned(),
            });
        }
        if let Some(v) = get("polar_disk_name") {
            self.storage.disk_name = v.to_owned();
        }
        if let Some(v) = get("polar_datadir") {
            self.storage.datadir = v.to_owned();
        }
        if let Some(v) = get("polar_storage_cluster_name") {
            self.storage.cluster_name = Some(v.to_owned());
        }
        if let Some(v) = get("shutdown_mode") {
            self.shutdown.mode = v.parse().map_err(CoreError::Config)?;
        }
        if let Some(v) = get("shutdown_timeout") {
            self.shutdown.timeout_secs = parse_num("shutdown_timeout", v)?;
        }
        if let Some(v) = get("shutdown_cleanup") {
            self.shutdown.cleanup = parse_bool("shutdown_cleanup", v)?;
        }
        if let Some(v) = get("pitr_fetch_logs_env") {
            let pitr: PitrEnv = serde_json::from_str(v)
                .map_err(|e| CoreError::Config(format!("pitr_fetch_logs_env: {e}")))?;
            self.pitr.source = Some(ConnectionParams {
                host: pitr.pitr_host,
                port: pitr.pitr_port,
                user: pitr.pitr_user,
                password: pitr.pitr_password,
                database: "postgres".to_owned(),
            });
        }
        Ok(())
    }

    pub fn layout(&self) -> InstanceLayout {
        InstanceLayout::new(
            &self.paths.data_dir,
            &self.paths.external_data_dir,
            &self.paths.log_dir,
        )
        .with_install_lock(&self.paths.install_lock)
        .with_restore_dir(&self.paths.restore_dir)
    }

    /// Wrap a command line so that it runs as the engine OS user.
    pub fn as_engine_user(&self, command: &str) -> String {
        if self.engine.switch_user {
            format!("su -l {} -c {}", self.engine.user, shell_quote(command))
        } else {
            command.to_owned()
        }
    }

    pub fn engine_user(&self) -> Option<String> {
        self.engine.switch_user.then(|| self.engine.user.clone())
    }

    /// Storage cluster name; Fibre Channel SAN always uses `disk`.
    pub fn storage_cluster(&self) -> String {
        if self.instance.storage_type == StorageType::FcSan {
            return "disk".to_owned();
        }
        self.storage.cluster_name.clone().unwrap_or_default()
    }

    /// A `pfs` invocation against the configured storage cluster.
    pub fn pfs_command(&self, args: &str) -> String {
        let cluster = self.storage_cluster();
        if cluster.is_empty() {
            format!("{} {args}", self.storage.pfs_bin.display())
        } else {
            format!("{} -C {cluster} {args}", self.storage.pfs_bin.display())
        }
    }

    pub fn shared_storage(&self) -> bool {
        self.instance.storage_type.is_shared() && self.instance.on_shared_storage
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.status_timeout_secs)
    }
}

/// Engine OS uid derived from the logical instance id.
pub fn uid_for_logic_id(logic_id: &str) -> Result<u32, CoreError> {
    let id: u64 = logic_id
        .trim()
        .parse()
        .map_err(|_| CoreError::MissingState(format!("logic id '{logic_id}' is not numeric")))?;
    Ok((id % 10_000) as u32 + 10_000)
}
