use crate::layout::InstanceLayout;
use crate::marker::MarkerFile;
use crate::StoreError;
use tracing::warn;

pub const STEP_PREPARE: &str = "prepare";
pub const STEP_DONE: &str = "done";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallProgress {
    NotStarted,
    InProgress,
    Complete,
}

impl std::fmt::Display for InstallProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallProgress::NotStarted => write!(f, "not-started"),
            InstallProgress::InProgress => write!(f, "in-progress"),
            InstallProgress::Complete => write!(f, "complete"),
        }
    }
}

/// The pair of markers that encode installation progress: the permanent
/// step marker in the data directory and the transient install lock.
#[derive(Debug, Clone)]
pub struct InstallMarkers {
    step: MarkerFile,
    lock: MarkerFile,
}

impl InstallMarkers {
    pub fn new(layout: &InstanceLayout) -> Self {
        Self {
            step: MarkerFile::new(layout.install_step()),
            lock: MarkerFile::new(layout.install_lock()),
        }
    }

    pub fn progress(&self) -> Result<InstallProgress, StoreError> {
        if self.step.read()?.as_deref() == Some(STEP_DONE) {
            return Ok(InstallProgress::Complete);
        }
        if self.lock.read()?.as_deref() == Some(STEP_PREPARE) {
            return Ok(InstallProgress::InProgress);
        }
        Ok(InstallProgress::NotStarted)
    }

    /// Claim the in-progress marker. Returns `false` when another invocation
    /// already holds it.
    pub fn begin(&self) -> Result<bool, StoreError> {
        if self.lock.try_acquire(STEP_PREPARE)? {
            return Ok(true);
        }
        match self.lock.read()? {
            Some(content) if content == STEP_PREPARE => Ok(false),
            other => {
                warn!(
                    "install lock {} holds {:?}, reclaiming",
                    self.lock.path().display(),
                    other
                );
                self.lock.set(STEP_PREPARE)?;
                Ok(true)
            }
        }
    }

    /// Drop the in-progress marker; safe to call whether or not it is held.
    pub fn end(&self) -> Result<(), StoreError> {
        self.lock.release()?;
        Ok(())
    }

    pub fn mark_complete(&self) -> Result<(), StoreError> {
        self.step.set(STEP_DONE)
    }

    pub fn is_complete(&self) -> Result<bool, StoreError> {
        Ok(self.progress()? == InstallProgress::Complete)
    }
}
