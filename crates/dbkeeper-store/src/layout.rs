use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

pub const STOP_LOCK_FILE: &str = "ins_lock";
pub const INSTALL_STEP_FILE: &str = "ins_install_step";
pub const INSTANCE_CTX_FILE: &str = "ins_ctx";
pub const LOGIC_ID_FILE: &str = "ins_logic_id";
pub const ENGINE_PID_FILE: &str = "postmaster.pid";
pub const DEFAULT_INSTALL_LOCK: &str = "/tmp/set_install_step_lock";
pub const DEFAULT_RESTORE_DIR: &str = "/home/pgsql/restore";

/// Paths of everything the tooling reads or writes for one instance.
///
/// The data directory holds the engine's files plus the durable markers
/// (stop lock, install step, identity). The install lock lives outside the
/// data directory so that clearing the data directory never drops it.
#[derive(Debug, Clone)]
pub struct InstanceLayout {
    data_dir: PathBuf,
    external_data_dir: PathBuf,
    log_dir: PathBuf,
    install_lock: PathBuf,
    restore_dir: PathBuf,
}

impl InstanceLayout {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        external_data_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            external_data_dir: external_data_dir.into(),
            log_dir: log_dir.into(),
            install_lock: PathBuf::from(DEFAULT_INSTALL_LOCK),
            restore_dir: PathBuf::from(DEFAULT_RESTORE_DIR),
        }
    }

    #[must_use]
    pub fn with_install_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.install_lock = path.into();
        self
    }

    #[must_use]
    pub fn with_restore_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.restore_dir = path.into();
        self
    }

    #[inline]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[inline]
    pub fn external_data_dir(&self) -> &Path {
        &self.external_data_dir
    }

    #[inline]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[inline]
    pub fn stop_lock(&self) -> PathBuf {
        self.data_dir.join(STOP_LOCK_FILE)
    }

    #[inline]
    pub fn install_step(&self) -> PathBuf {
        self.data_dir.join(INSTALL_STEP_FILE)
    }

    #[inline]
    pub fn install_lock(&self) -> &Path {
        &self.install_lock
    }

    #[inline]
    pub fn instance_ctx(&self) -> PathBuf {
        self.data_dir.join(INSTANCE_CTX_FILE)
    }

    #[inline]
    pub fn logic_id(&self) -> PathBuf {
        self.data_dir.join(LOGIC_ID_FILE)
    }

    /// Status file the engine maintains while running; its last line
    /// carries the readiness token.
    #[inline]
    pub fn engine_pid_file(&self) -> PathBuf {
        self.data_dir.join(ENGINE_PID_FILE)
    }

    /// `<data>/log`, which is kept as a symlink into the log volume.
    #[inline]
    pub fn engine_log_link(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    #[inline]
    pub fn engine_log_dir(&self) -> PathBuf {
        self.log_dir.join("pg_log")
    }

    #[inline]
    pub fn engine_ctl_log(&self) -> PathBuf {
        self.log_dir.join("pg_ctl.log")
    }

    #[inline]
    pub fn restore_dir(&self) -> &Path {
        &self.restore_dir
    }

    #[inline]
    pub fn downloads_dir(&self) -> PathBuf {
        self.restore_dir.join("downloads")
    }

    #[inline]
    pub fn job_status(&self) -> PathBuf {
        self.restore_dir.join("status")
    }

    #[inline]
    pub fn job_status_lock(&self) -> PathBuf {
        self.restore_dir.join("status.lock")
    }

    #[inline]
    pub fn job_worker(&self) -> PathBuf {
        self.restore_dir.join("worker")
    }

    #[inline]
    pub fn job_log(&self) -> PathBuf {
        self.restore_dir.join("log")
    }

    /// Create the data, external data and log directories.
    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.external_data_dir)?;
        fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
