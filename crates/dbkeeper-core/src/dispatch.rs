//! Mapping of orchestrator requests (`srv_opr_type`/`srv_opr_action`) onto
//! the operations this crate implements.

use crate::CoreError;
use std::collections::HashMap;

pub const REQUEST_TYPE_KEY: &str = "srv_opr_type";
pub const REQUEST_ACTION_KEY: &str = "srv_opr_action";
const SECRET_KEYS: [&str; 3] = ["srv_opr_password", "password", "pitr_fetch_logs_env"];
const MASK: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stop and leave the stop lock behind.
    LockStop,
    /// Clear the stop lock so the supervisor relaunches.
    UnlockStart,
    Restart,
    /// Stop without a lock; the supervisor exits with the engine.
    ProcessCleanup,
    GracefulStop,
    SetupInstall,
    RebuildLocal,
    FetchWal,
    FetchWalWorker,
    FetchStatus,
    DownloadStatus,
    LockExpire,
    UnlockExpire,
}

impl Action {
    pub fn from_request(kind: &str, action: &str) -> Result<Self, CoreError> {
        let parsed = match (kind, action) {
            ("stop", "graceful_stop") => Action::GracefulStop,
            ("lock_ins", "lock_ins_expire") => Action::LockExpire,
            ("lock_ins", "unlock_ins_expire") => Action::UnlockExpire,
            ("hostins_ops", "stop_instance") | (_, "lock_stop_instance") => Action::LockStop,
            ("hostins_ops", "start_instance") | (_, "unlock_start_instance") => {
                Action::UnlockStart
            }
            ("hostins_ops", "restart_instance") => Action::Restart,
            ("hostins_ops", "process_cleanup") => Action::ProcessCleanup,
            ("hostins_ops", "setup_install_instance") => Action::SetupInstall,
            ("hostins_ops", "fetch_archive_log_from_source") => Action::FetchWal,
            ("hostins_ops", "do_fetch_archive_log_from_source") => Action::FetchWalWorker,
            ("hostins_ops", "check_fetch_archive_from_source_status") => Action::FetchStatus,
            ("hostins_ops", "check_download_archive_status") => Action::DownloadStatus,
            (_, "rebuild_local_dir") => Action::RebuildLocal,
            _ => {
                return Err(CoreError::UnknownAction(format!(
                    "{REQUEST_TYPE_KEY}={kind} {REQUEST_ACTION_KEY}={action}"
                )))
            }
        };
        Ok(parsed)
    }

    /// Read the request keys from the environment map.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self, CoreError> {
        let get = |key: &str| env.get(key).map_or("", String::as_str);
        Self::from_request(get(REQUEST_TYPE_KEY), get(REQUEST_ACTION_KEY))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::LockStop => "lock_stop_instance",
            Action::UnlockStart => "unlock_start_instance",
            Action::Restart => "restart_instance",
            Action::ProcessCleanup => "process_cleanup",
            Action::GracefulStop => "graceful_stop",
            Action::SetupInstall => "setup_install_instance",
            Action::RebuildLocal => "rebuild_local_dir",
            Action::FetchWal => "fetch_archive_log_from_source",
            Action::FetchWalWorker => "do_fetch_archive_log_from_source",
            Action::FetchStatus => "check_fetch_archive_from_source_status",
            Action::DownloadStatus => "check_download_archive_status",
            Action::LockExpire => "lock_ins_expire",
            Action::UnlockExpire => "unlock_ins_expire",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator-supplied keys (lowercase by convention) as `key=value`
/// lines for the request log, secrets masked.
pub fn mask_secrets(env: &HashMap<String, String>) -> Vec<String> {
    let mut lines: Vec<String> = env
        .iter()
        .filter(|(k, _)| !k.chars().any(|c| c.is_ascii_uppercase()))
        .map(|(k, v)| {
            if SECRET_KEYS.contains(&k.as_str()) {
                format!("{k}={MASK}")
            } else {
                format!("{k}={v}")
            }
        })
        .collect();
    lines.sort();
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_operations_map_to_actions() {
        assert_eq!(
            Action::from_request("hostins_ops", "stop_instance").unwrap(),
            Action::LockStop
        );
        assert_eq!(
            Action::from_request("hostins_ops", "start_instance").unwrap(),
            Action::UnlockStart
        );
        assert_eq!(
            Action::from_request("hostins_ops", "do_fetch_archive_log_from_source").unwrap(),
            Action::FetchWalWorker
        );
        assert_eq!(
            Action::from_request("stop", "graceful_stop").unwrap(),
            Action::GracefulStop
        );
    }

    #[test]
    fn lock_actions_accept_any_request_type() {
        assert_eq!(
            Action::from_request("whatever", "lock_stop_instance").unwrap(),
            Action::LockStop
        );
        assert_eq!(
            Action::from_request("", "rebuild_local_dir").unwrap(),
            Action::RebuildLocal
        );
    }

    #[test]
    fn unknown_request_is_rejected() {
        let err = Action::from_request("account", "create").unwrap_err();
        assert!(matches!(err, CoreError::UnknownAction(_)));
        assert!(Action::from_request("stop", "restart_instance").is_err());
    }

    #[test]
    fn from_env_reads_request_keys() {
        let env: HashMap<String, String> = [
            ("srv_opr_type", "lock_ins"),
            ("srv_opr_action", "unlock_ins_expire"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        assert_eq!(Action::from_env(&env).unwrap(), Action::UnlockExpire);
        assert!(Action::from_env(&HashMap::new()).is_err());
    }

    #[test]
    fn secrets_are_masked_and_system_env_hidden() {
        let env: HashMap<String, String> = [
            ("srv_opr_type", "hostins_ops"),
            ("password", "hunter2"),
            ("pitr_fetch_logs_env", "{\"pitr_password\":\"x\"}"),
            ("PATH", "/usr/bin"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        assert_eq!(
            mask_secrets(&env),
            vec![
                "password=********".to_owned(),
                "pitr_fetch_logs_env=********".to_owned(),
                "srv_opr_type=hostins_ops".to_owned(),
            ]
        );
    }

    #[test]
    fn action_names_round_trip_through_host_ops() {
        for action in [
            Action::Restart,
            Action::ProcessCleanup,
            Action::SetupInstall,
            Action::FetchWal,
            Action::FetchStatus,
            Action::DownloadStatus,
        ] {
            assert_eq!(
                Action::from_request("hostins_ops", action.as_str()).unwrap(),
                action
            );
        }
    }
}
