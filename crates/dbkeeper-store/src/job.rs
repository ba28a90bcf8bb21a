use crate::layout::InstanceLayout;
use crate::marker::MarkerFile;
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Background job record, serialized as one flat JSON object.
///
/// The fetch worker owns the `fetch_from_source_*` keys; the bulk download
/// worker owns `total_tasks`/`completed_tasks`. Keys written by other
/// collaborators are carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(
        rename = "fetch_from_source_pid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub worker_pid: Option<u32>,
    #[serde(
        rename = "fetch_from_source_start_time",
        default,
        deserialize_with = "deserialize_start_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "fetch_from_source_status",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<JobState>,
    #[serde(
        rename = "fetch_from_source_msg",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<String>,
    #[serde(default)]
    pub total_tasks: Vec<String>,
    #[serde(default)]
    pub completed_tasks: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobStatus {
    /// Replace the worker identity, keeping task counters and foreign keys.
    pub fn claim(&mut self, pid: u32, now: DateTime<Utc>) {
        self.worker_pid = Some(pid);
        self.start_time = Some(now);
        self.state = Some(JobState::Running);
        self.message = None;
    }

    pub fn finish(&mut self, state: JobState, message: impl Into<String>) {
        self.state = Some(state);
        self.message = Some(message.into());
    }
}

/// Older writers stored the start time as fractional epoch seconds; both
/// forms load, and it is always written back as RFC 3339.
fn deserialize_start_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StartTime {
        Rfc3339(DateTime<Utc>),
        EpochSeconds(f64),
    }

    match Option::<StartTime>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StartTime::Rfc3339(at)) => Ok(Some(at)),
        Some(StartTime::EpochSeconds(secs)) => {
            let nanos = (secs.fract() * 1e9) as u32;
            DateTime::from_timestamp(secs.trunc() as i64, nanos)
                .map(Some)
                .ok_or_else(|| {
                    serde::de::Error::custom(format!("start time {secs} is out of range"))
                })
        }
    }
}

/// Status record at `<restore>/status`, always rewritten wholesale.
#[derive(Debug, Clone)]
pub struct JobStatusStore {
    path: PathBuf,
}

impl JobStatusStore {
    pub fn new(layout: &InstanceLayout) -> Self {
        Self {
            path: layout.job_status(),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<JobStatus>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, status: &JobStatus) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(status)?;
        crate::write_atomic(&self.path, content.as_bytes())
    }
}

/// Pid of the most recently launched background worker.
#[derive(Debug, Clone)]
pub struct WorkerPidFile {
    marker: MarkerFile,
}

impl WorkerPidFile {
    pub fn new(layout: &InstanceLayout) -> Self {
        Self {
            marker: MarkerFile::new(layout.job_worker()),
        }
    }

    pub fn read(&self) -> Result<Option<u32>, StoreError> {
        match self.marker.read()? {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| StoreError::InvalidPid {
                path: self.marker.path().display().to_string(),
                value: raw,
            }),
        }
    }

    pub fn write(&self, pid: u32) -> Result<(), StoreError> {
        self.marker.set(&pid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, InstanceLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(
            dir.path().join("data"),
            dir.path().join("ext"),
            dir.path().join("log"),
        )
        .with_restore_dir(dir.path().join("restore"));
        (dir, layout)
    }

    #[test]
    fn load_missing_is_none() {
        let (_dir, layout) = setup();
        assert!(JobStatusStore::new(&layout).load().unwrap().is_none());
    }

    #[test]
    fn claim_overwrites_identity_and_keeps_tasks() {
        let (_dir, layout) = setup();
        let store = JobStatusStore::new(&layout);
        let mut status = JobStatus {
            worker_pid: Some(10),
            state: Some(JobState::Failed),
            message: Some("old".to_owned()),
            total_tasks: vec!["a".to_owned()],
            ..JobStatus::default()
        };
        status.claim(20, Utc::now());
        store.save(&status).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.worker_pid, Some(20));
        assert_eq!(loaded.state, Some(JobState::Running));
        assert!(loaded.message.is_none());
        assert_eq!(loaded.total_tasks, vec!["a".to_owned()]);
    }

    #[test]
    fn record_uses_collaborator_key_names() {
        let (_dir, layout) = setup();
        let store = JobStatusStore::new(&layout);
        let mut status = JobStatus::default();
        status.claim(42, Utc::now());
        status.finish(JobState::Completed, "fetched");
        store.save(&status).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["fetch_from_source_pid"], 42);
        assert_eq!(value["fetch_from_source_status"], "completed");
        assert_eq!(value["fetch_from_source_msg"], "fetched");
    }

    #[test]
    fn foreign_keys_survive_rewrite() {
        let (_dir, layout) = setup();
        let store = JobStatusStore::new(&layout);
        std::fs::create_dir_all(layout.restore_dir()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"total_tasks":["A","B"],"completed_tasks":{"A":1},"restore_target":"x"}"#,
        )
        .unwrap();

        let mut status = store.load().unwrap().unwrap();
        assert_eq!(status.completed_tasks.len(), 1);
        status.claim(5, Utc::now());
        store.save(&status).unwrap();

        let again = store.load().unwrap().unwrap();
        assert_eq!(again.extra["restore_target"], "x");
        assert_eq!(again.total_tasks.len(), 2);
    }

    #[test]
    fn epoch_start_time_loads_and_keeps_tasks() {
        let (_dir, layout) = setup();
        let store = JobStatusStore::new(&layout);
        std::fs::create_dir_all(layout.restore_dir()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"fetch_from_source_pid":77,"fetch_from_source_start_time":1700000000.5,
                "fetch_from_source_status":"running","total_tasks":["A","B","C"]}"#,
        )
        .unwrap();

        let mut status = store.load().unwrap().unwrap();
        let expected = DateTime::parse_from_rfc3339("2023-11-14T22:13:20.5Z").unwrap();
        assert_eq!(status.start_time, Some(expected.with_timezone(&Utc)));
        assert_eq!(status.total_tasks.len(), 3);

        status.claim(78, Utc::now());
        store.save(&status).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["fetch_from_source_start_time"].is_string());
        assert_eq!(value["total_tasks"], serde_json::json!(["A", "B", "C"]));
    }

    #[test]
    fn null_start_time_is_absent() {
        let (_dir, layout) = setup();
        let store = JobStatusStore::new(&layout);
        std::fs::create_dir_all(layout.restore_dir()).unwrap();
        std::fs::write(store.path(), r#"{"fetch_from_source_start_time":null}"#).unwrap();
        assert!(store.load().unwrap().unwrap().start_time.is_none());
    }

    #[test]
    fn worker_pid_file() {
        let (_dir, layout) = setup();
        let worker = WorkerPidFile::new(&layout);
        assert!(worker.read().unwrap().is_none());
        worker.write(1234).unwrap();
        assert_eq!(worker.read().unwrap(), Some(1234));
    }

    #[test]
    fn worker_pid_file_rejects_garbage() {
        let (_dir, layout) = setup();
        std::fs::create_dir_all(layout.restore_dir()).unwrap();
        std::fs::write(layout.job_worker(), "not-a-pid").unwrap();
        assert!(matches!(
            WorkerPidFile::new(&layout).read(),
            Err(StoreError::InvalidPid { .. })
        ));
    }

    #[test]
    fn job_state_display_matches_serde() {
        for state in [JobState::Running, JobState::Completed, JobState::Failed] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }
}
