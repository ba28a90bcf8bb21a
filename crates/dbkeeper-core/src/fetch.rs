//! Point-in-time-recovery WAL fetch: a cheap request that spawns a detached
//! worker, the worker itself, and the status polls that reconcile the
//! persisted record with worker liveness.

use crate::concurrency::JobRecordLock;
use crate::config::KeeperConfig;
use crate::CoreError;
use dbkeeper_runtime::{
    pid_alive, CommandRunner, DetachedCommand, JobHandle, SqlExecutor, WorkerSpawner,
};
use dbkeeper_store::{InstanceLayout, JobState, JobStatus, JobStatusStore, WorkerPidFile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

const FLUSH_POSITION_QUERY: &str = "select pg_current_wal_flush_lsn()";
const PARTIAL_SUFFIX: &str = ".partial";

/// WAL position in the engine's `hi/lo` hexadecimal notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Lsn(pub u64);

impl FromStr for Lsn {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidLsn(s.to_owned());
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Exclusive end boundary for a fetch up to `current`.
pub fn end_lsn_before(current: Lsn) -> Result<Lsn, CoreError> {
    current
        .0
        .checked_sub(1)
        .map(Lsn)
        .ok_or_else(|| CoreError::InvalidLsn(format!("{current} has no predecessor")))
}

/// A dead worker can't still be running; if it left `running` behind, it
/// crashed.
pub fn classify_fetch(worker_alive: bool, persisted: Option<JobState>) -> JobState {
    if worker_alive {
        return JobState::Running;
    }
    match persisted {
        None | Some(JobState::Running) => JobState::Failed,
        Some(state) => state,
    }
}

/// Bulk downloads are done when every task is, whatever the worker's fate.
pub fn classify_download(worker_alive: bool, total: usize, completed: usize) -> JobState {
    if total == completed {
        JobState::Completed
    } else if worker_alive {
        JobState::Running
    } else {
        JobState::Failed
    }
}

/// Answer to a status poll, printed as one JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobState,
    pub msg: String,
}

impl StatusReport {
    pub fn new(status: JobState, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }
}

pub struct FetchJob<'a> {
    config: &'a KeeperConfig,
    layout: InstanceLayout,
    runner: &'a dyn CommandRunner,
    store: JobStatusStore,
    worker: WorkerPidFile,
    own_pid: u32,
}

impl<'a> FetchJob<'a> {
    pub fn new(config: &'a KeeperConfig, runner: &'a dyn CommandRunner) -> Self {
        let layout = config.layout();
        Self {
            config,
            store: JobStatusStore::new(&layout),
            worker: WorkerPidFile::new(&layout),
            layout,
            runner,
            own_pid: std::process::id(),
        }
    }

    /// Act as the worker with this pid instead of the current process.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Spawn the worker in the background and return at once.
    pub fn request(
        &self,
        spawner: &dyn WorkerSpawner,
        program: &Path,
        args: &[String],
    ) -> Result<JobHandle, CoreError> {
        fs::create_dir_all(self.layout.downloads_dir())?;
        let cmd = DetachedCommand {
            program: program.to_path_buf(),
            args: args.to_vec(),
            env: Vec::new(),
            log_path: self.layout.job_log(),
        };
        let handle = spawner.spawn(&cmd)?;
        info!(
            "fetch worker {} started, logging to {}",
            handle.pid(),
            cmd.log_path.display()
        );
        Ok(handle)
    }

    /// Worker body: take over the job record, fetch WAL up to the source's
    /// current position, move it to shared storage, record the result.
    pub fn run_worker(&self, sql: &dyn SqlExecutor) -> Result<StatusReport, CoreError> {
        self.take_over()?;
        let report = match self.fetch(sql) {
            Ok(end) => StatusReport::new(
                JobState::Completed,
                format!("pg_receivewal done, end lsn: {end}"),
            ),
            Err(e) => {
                error!("fetch failed: {e}");
                StatusReport::new(JobState::Failed, e.to_string())
            }
        };
        self.record(&report)?;
        Ok(report)
    }

    fn take_over(&self) -> Result<(), CoreError> {
        JobRecordLock::acquire(&self.layout)?.take_over(self.own_pid)?;
        Ok(())
    }

    fn fetch(&self, sql: &dyn SqlExecutor) -> Result<Lsn, CoreError> {
        let source = self.config.pitr.source.as_ref().ok_or_else(|| {
            CoreError::Config("no PITR source connection configured".to_owned())
        })?;
        let flushed: Lsn = sql.query_scalar(source, FLUSH_POSITION_QUERY)?.parse()?;
        let end = end_lsn_before(flushed)?;
        info!("source flushed up to {flushed}, fetching until {end}");

        let downloads = self.layout.downloads_dir();
        fs::create_dir_all(&downloads)?;
        let receive = format!(
            "{}/pg_receivewal -p {} -h {} -U {} -D {} -E {end} -v --no-loop",
            self.config.engine.bin_dir.display(),
            source.port,
            source.host,
            source.user,
            downloads.display()
        );
        self.runner.check_with_env(
            &receive,
            &[("PGPASSWORD".to_owned(), source.password.clone())],
            Duration::from_secs(self.config.pitr.receive_timeout_secs),
        )?;

        let files = finalize_partials(&downloads)?;
        self.move_to_shared_storage(&files)?;
        Ok(end)
    }

    fn move_to_shared_storage(&self, files: &[PathBuf]) -> Result<(), CoreError> {
        let timeout = Duration::from_secs(self.config.pitr.copy_timeout_secs);
        for file in files {
            let copy = self.config.pfs_command(&format!(
                "cp -f {} {}/pg_wal/",
                file.display(),
                self.config.storage.datadir
            ));
            self.runner.check(&copy, timeout)?;
            fs::remove_file(file)?;
            debug!("moved {} to shared storage", file.display());
        }
        info!("moved {} WAL files to shared storage", files.len());
        Ok(())
    }

    /// Final write, unless another worker has taken the record over since.
    fn record(&self, report: &StatusReport) -> Result<(), CoreError> {
        let lock = JobRecordLock::acquire(&self.layout)?;
        if lock.finish(self.own_pid, report.status, &report.msg)? {
            info!("fetch {}: {}", report.status, report.msg);
        }
        Ok(())
    }

    pub fn check_fetch_status(&self) -> Result<StatusReport, CoreError> {
        let status = self.load_record()?;
        let alive = status.worker_pid.is_some_and(pid_alive);
        let persisted = status.state.unwrap_or(JobState::Running);
        let pid = status
            .worker_pid
            .map_or_else(|| "none".to_owned(), |p| p.to_string());
        Ok(StatusReport::new(
            classify_fetch(alive, status.state),
            format!("status:{persisted}, pid:{pid}, pid exists:{alive}"),
        ))
    }

    pub fn check_download_status(&self) -> Result<StatusReport, CoreError> {
        let status = self.load_record()?;
        let alive = self.worker.read()?.is_some_and(pid_alive);
        let total = status.total_tasks.len();
        let completed = status.completed_tasks.len();
        Ok(StatusReport::new(
            classify_download(alive, total, completed),
            format!("all wal files:{total}, complete files:{completed}"),
        ))
    }

    fn load_record(&self) -> Result<JobStatus, CoreError> {
        self.store.load()?.ok_or_else(|| {
            CoreError::MissingState(format!(
                "no job record at {}",
                self.store.path().display()
            ))
        })
    }
}

/// Give `.partial` segments their final names; returns every file in `dir`.
fn finalize_partials(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or_default();
        match name.strip_suffix(PARTIAL_SUFFIX) {
            Some(done) => {
                let final_path = dir.join(done);
                fs::rename(&path, &final_path)?;
                files.push(final_path);
            }
            None => files.push(path),
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dbkeeper_runtime::mock::{MockRunner, MockSpawner, MockSql};
    use dbkeeper_runtime::ConnectionParams;

    fn config(root: &Path) -> KeeperConfig {
        let mut cfg = KeeperConfig::default();
        cfg.paths.data_dir = root.join("data");
        cfg.paths.external_data_dir = root.join("ext");
        cfg.paths.log_dir = root.join("log");
        cfg.paths.restore_dir = root.join("restore");
        cfg.engine.bin_dir = PathBuf::from("/u01/polardbmpd/bin");
        cfg.storage.datadir = "/pbd-0/data".to_owned();
        cfg.storage.cluster_name = Some("polarstore".to_owned());
        cfg.pitr.source = Some(ConnectionParams {
            host: "10.0.0.9".to_owned(),
            port: 5433,
            user: "pitr".to_owned(),
            password: "s3cret".to_owned(),
            database: "postgres".to_owned(),
        });
        cfg
    }

    #[test]
    fn lsn_round_trips_in_engine_notation() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn lsn_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("16".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
        assert!("1/100000000".parse::<Lsn>().is_err());
    }

    #[test]
    fn end_boundary_borrows_across_the_segment_word() {
        assert_eq!(
            end_lsn_before("0/3000060".parse().unwrap()).unwrap().to_string(),
            "0/300005F"
        );
        assert_eq!(
            end_lsn_before("1/0".parse().unwrap()).unwrap().to_string(),
            "0/FFFFFFFF"
        );
        assert!(end_lsn_before(Lsn(0)).is_err());
    }

    #[test]
    fn dead_running_worker_is_failed() {
        assert_eq!(classify_fetch(true, Some(JobState::Completed)), JobState::Running);
        assert_eq!(classify_fetch(false, Some(JobState::Running)), JobState::Failed);
        assert_eq!(classify_fetch(false, None), JobState::Failed);
        assert_eq!(
            classify_fetch(false, Some(JobState::Completed)),
            JobState::Completed
        );
    }

    #[test]
    fn download_completion_ignores_liveness() {
        assert_eq!(classify_download(false, 3, 3), JobState::Completed);
        assert_eq!(classify_download(true, 3, 3), JobState::Completed);
        assert_eq!(classify_download(true, 3, 2), JobState::Running);
        assert_eq!(classify_download(false, 3, 2), JobState::Failed);
    }

    #[test]
    fn request_spawns_worker_with_job_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runner = MockRunner::new();
        let spawner = MockSpawner::new(4242);
        let job = FetchJob::new(&cfg, &runner);

        let handle = job
            .request(&spawner, Path::new("/usr/bin/dbkeeper"), &["fetch-wal-worker".to_owned()])
            .unwrap();
        assert_eq!(handle.pid(), 4242);
        let spawned = spawner.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].log_path, dir.path().join("restore").join("log"));
        assert!(dir.path().join("restore").join("downloads").is_dir());
    }

    #[test]
    fn worker_fetches_renames_and_moves() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let downloads = dir.path().join("restore").join("downloads");
        fs::create_dir_all(&downloads).unwrap();
        fs::write(downloads.join("000000010000000000000002"), "").unwrap();
        fs::write(downloads.join("000000010000000000000003.partial"), "").unwrap();

        let runner = MockRunner::new();
        let sql = MockSql::returning("0/3000060");
        let job = FetchJob::new(&cfg, &runner).with_pid(std::process::id());
        let report = job.run_worker(&sql).unwrap();

        assert_eq!(report.status, JobState::Completed);
        assert_eq!(report.msg, "pg_receivewal done, end lsn: 0/300005F");
        assert_eq!(sql.statements(), vec![FLUSH_POSITION_QUERY.to_owned()]);

        let calls = runner.calls();
        assert!(calls[0].contains("pg_receivewal -p 5433 -h 10.0.0.9 -U pitr"));
        assert!(calls[0].contains("-E 0/300005F"));
        assert!(!calls[0].contains("s3cret"));
        assert_eq!(
            runner.envs()[0],
            vec![("PGPASSWORD".to_owned(), "s3cret".to_owned())]
        );
        assert!(calls[1].ends_with("000000010000000000000002 /pbd-0/data/pg_wal/"));
        assert!(calls[2].ends_with("000000010000000000000003 /pbd-0/data/pg_wal/"));
        assert!(calls[1].contains("-C polarstore cp -f"));
        assert_eq!(fs::read_dir(&downloads).unwrap().count(), 0);

        let record = JobStatusStore::new(&cfg.layout()).load().unwrap().unwrap();
        assert_eq!(record.worker_pid, Some(std::process::id()));
        assert_eq!(record.state, Some(JobState::Completed));
    }

    #[test]
    fn receive_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runner = MockRunner::new();
        runner.respond("pg_receivewal", 1, "could not connect");
        let sql = MockSql::returning("0/3000060");
        let job = FetchJob::new(&cfg, &runner).with_pid(std::process::id());

        let report = job.run_worker(&sql).unwrap();
        assert_eq!(report.status, JobState::Failed);
        assert!(report.msg.contains("could not connect"));
        let record = JobStatusStore::new(&cfg.layout()).load().unwrap().unwrap();
        assert_eq!(record.state, Some(JobState::Failed));
    }

    #[test]
    fn superseded_worker_leaves_record_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runner = MockRunner::new();
        let job = FetchJob::new(&cfg, &runner).with_pid(std::process::id());
        job.take_over().unwrap();

        let store = JobStatusStore::new(&cfg.layout());
        let mut record = store.load().unwrap().unwrap();
        record.claim(u32::MAX - 1, Utc::now());
        store.save(&record).unwrap();

        job.record(&StatusReport::new(JobState::Completed, "done"))
            .unwrap();
        let after = store.load().unwrap().unwrap();
        assert_eq!(after.worker_pid, Some(u32::MAX - 1));
        assert_eq!(after.state, Some(JobState::Running));
    }

    #[test]
    fn status_poll_without_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runner = MockRunner::new();
        let job = FetchJob::new(&cfg, &runner);
        assert!(matches!(
            job.check_fetch_status(),
            Err(CoreError::MissingState(_))
        ));
    }

    #[test]
    fn status_poll_on_live_worker() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runner = MockRunner::new();
        let job = FetchJob::new(&cfg, &runner).with_pid(std::process::id());
        job.take_over().unwrap();

        let report = job.check_fetch_status().unwrap();
        assert_eq!(report.status, JobState::Running);
        assert_eq!(
            report.msg,
            format!("status:running, pid:{}, pid exists:true", std::process::id())
        );
    }
}
