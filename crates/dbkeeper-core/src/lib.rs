//! Lifecycle core for a database engine running inside a managed container.
//!
//! The pieces, leaf first: `KeeperConfig` is built once at process start and
//! handed to everything else; `Installer` performs the one-time construction
//! of on-disk state; `StopController` provides the idempotent stop, start and
//! restart primitives; `Supervisor` launches the engine and reconciles each
//! exit against the stop lock; `FetchJob` runs the detached WAL fetch worker
//! and answers status polls. All coordination between these, which run as
//! separate processes, goes through marker files and process liveness.

pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod fetch;
pub mod install;
pub mod lifecycle;
pub mod stop;
pub mod supervisor;

pub use concurrency::{install_signal_handler, shutdown_requested, JobRecordLock};
pub use config::{
    ConsensusRole, InstallSource, KeeperConfig, ServiceRole, StandbyRebuild, StorageType,
};
pub use dispatch::{mask_secrets, Action};
pub use fetch::{
    classify_download, classify_fetch, end_lsn_before, FetchJob, Lsn, StatusReport,
};
pub use install::{
    ConfigWriter, InstallOutcome, InstallRole, Installer, TemplateConfigWriter,
};
pub use lifecycle::{classify_exit, validate_transition, ExitDisposition, SupervisorState};
pub use stop::{reap_candidates, StartOutcome, StopController, StopOutcome};
pub use supervisor::{inject_preload, preload_configured, Cycle, Supervisor};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] dbkeeper_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] dbkeeper_runtime::RuntimeError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("installation failed: {0}")]
    Installation(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("required state missing: {0}")]
    MissingState(String),
    #[error("invalid WAL position: {0}")]
    InvalidLsn(String),
    #[error("unknown request: {0}")]
    UnknownAction(String),
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("engine did not stop within {0}s")]
    StopTimedOut(u64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
