use crate::CoreError;
use chrono::Utc;
use dbkeeper_runtime::JobHandle;
use dbkeeper_store::{InstanceLayout, JobState, JobStatus, JobStatusStore, WorkerPidFile};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Exclusive hold on the background job's ownership: the status record and
/// the worker pid file. Held through a `flock` on `<restore>/status.lock`, so
/// a worker taking over and a superseded worker finishing never interleave
/// their read-kill-write sequences. Released on drop.
pub struct JobRecordLock {
    file: File,
    store: JobStatusStore,
    worker: WorkerPidFile,
}

impl JobRecordLock {
    /// Block until no other worker holds the record.
    pub fn acquire(layout: &InstanceLayout) -> Result<Self, CoreError> {
        let path = layout.job_status_lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        debug!("holding {}", path.display());
        Ok(Self {
            file,
            store: JobStatusStore::new(layout),
            worker: WorkerPidFile::new(layout),
        })
    }

    /// Kill every other worker named by the worker file or the record, then
    /// claim both for `own_pid`. Task counters in the record are kept.
    /// Returns the pids that were still alive and got killed.
    pub fn take_over(&self, own_pid: u32) -> Result<Vec<u32>, CoreError> {
        let previous = self.worker.read().unwrap_or_else(|e| {
            warn!("ignoring unreadable worker file: {e}");
            None
        });
        let mut status = self.store.load().unwrap_or_else(|e| {
            warn!("discarding unreadable job record: {e}");
            None
        });
        let mut stale: Vec<u32> = previous
            .into_iter()
            .chain(status.as_ref().and_then(|s| s.worker_pid))
            .filter(|pid| *pid != own_pid)
            .collect();
        stale.dedup();

        let mut killed = Vec::new();
        for pid in stale {
            match JobHandle::from_pid(pid).terminate() {
                Ok(true) => {
                    info!("killed previous fetch worker {pid}");
                    killed.push(pid);
                }
                Ok(false) => debug!("previous fetch worker {pid} already gone"),
                Err(e) => warn!("could not kill previous fetch worker {pid}: {e}"),
            }
        }

        self.worker.write(own_pid)?;
        let status = status.get_or_insert_with(JobStatus::default);
        status.claim(own_pid, Utc::now());
        self.store.save(status)?;
        info!("fetch worker {own_pid} owns the job record");
        Ok(killed)
    }

    /// Record the outcome for `own_pid`. Returns `false`, leaving the record
    /// alone, when another worker has taken over since.
    pub fn finish(&self, own_pid: u32, state: JobState, message: &str) -> Result<bool, CoreError> {
        let mut status = self.store.load()?.unwrap_or_default();
        if status.worker_pid != Some(own_pid) {
            warn!(
                "job record now belongs to worker {:?}, not recording {state}",
                status.worker_pid
            );
            return Ok(false);
        }
        status.finish(state, message);
        self.store.save(&status)?;
        Ok(true)
    }
}

impl Drop for JobRecordLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("failed to release job record lock: {e}");
        }
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// SIGINT/SIGTERM ends the supervisor's and installer's waits at their next
/// poll. A second signal exits at once.
pub fn install_signal_handler() {
    if let Err(e) = ctrlc::set_handler(|| {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(1);
        }
        eprintln!("shutdown requested, leaving the current wait");
    }) {
        warn!("could not install signal handler: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
