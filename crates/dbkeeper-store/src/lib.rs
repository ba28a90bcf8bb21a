//! On-disk state for a supervised database instance.
//!
//! Everything here is file-backed so that independent invocations of the
//! tooling (supervisor, dispatch requests, the background fetch worker) can
//! coordinate through the filesystem: `InstanceLayout` names the paths,
//! `MarkerFile` implements the existence/content flags, `InstallMarkers`
//! derives installation progress from them, `IdentityStore` keeps the
//! instance identity and context, and `JobStatusStore` persists the
//! background job record atomically.

pub mod context;
pub mod job;
pub mod layout;
pub mod marker;
pub mod progress;

pub use context::{IdentityStore, InstanceContext};
pub use job::{JobState, JobStatus, JobStatusStore, WorkerPidFile};
pub use layout::InstanceLayout;
pub use marker::MarkerFile;
pub use progress::{InstallMarkers, InstallProgress, STEP_DONE, STEP_PREPARE};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` inside it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `contents` via temp file + rename + directory fsync.
///
/// Readers either see the previous file or the complete new one, never a
/// partially written record.
pub(crate) fn write_atomic(dest: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("marker '{path}' has unexpected content: {content:?}")]
    InvalidMarker { path: String, content: String },
    #[error("invalid worker pid in '{path}': {value:?}")]
    InvalidPid { path: String, value: String },
}
