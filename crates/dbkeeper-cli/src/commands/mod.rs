pub mod dispatch;
pub mod fetch;
pub mod install;
pub mod stop;
pub mod supervise;

use dbkeeper_core::{KeeperConfig, StatusReport, TemplateConfigWriter};
use dbkeeper_runtime::{CommandRunner, PgCtl, ShellAccounts, ShellRunner};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;
/// The supervisor's own control logic failed, as opposed to the engine.
pub const EXIT_SUPERVISOR_ERROR: u8 = 255;

/// Everything a command needs, built once in `main`.
pub struct Context {
    pub config: KeeperConfig,
    pub config_path: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub json: bool,
    pub runner: Arc<dyn CommandRunner>,
}

impl Context {
    pub fn new(
        config: KeeperConfig,
        config_path: Option<PathBuf>,
        env: HashMap<String, String>,
        json: bool,
    ) -> Self {
        Self {
            config,
            config_path,
            env,
            json,
            runner: Arc::new(ShellRunner::new()),
        }
    }

    pub fn pg_ctl(&self) -> PgCtl {
        let layout = self.config.layout();
        PgCtl::new(
            Arc::clone(&self.runner),
            &self.config.engine.bin_dir,
            layout.data_dir(),
            layout.engine_ctl_log(),
        )
        .as_user(self.config.engine_user())
        .with_status_timeout(self.config.status_timeout())
    }

    pub fn accounts(&self) -> ShellAccounts {
        ShellAccounts::new(Arc::clone(&self.runner))
    }

    pub fn config_writer(&self) -> TemplateConfigWriter {
        TemplateConfigWriter::new(&self.config.paths.template_dir)
    }
}

pub fn json_line(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Status polls always answer with one JSON line on stdout.
pub fn print_report(report: &StatusReport) -> Result<u8, String> {
    println!("{}", json_line(report)?);
    Ok(EXIT_SUCCESS)
}

/// Print a human line, or `{"result": ...}` under `--json`.
pub fn print_outcome(json: bool, result: &str, human: &str) -> Result<u8, String> {
    if json {
        println!("{}", json_line(&serde_json::json!({ "result": result }))?);
    } else {
        println!("{human}");
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbkeeper_store::JobState;

    #[test]
    fn report_serializes_as_single_line() {
        let report = StatusReport::new(JobState::Failed, "status:running, pid:7, pid exists:false");
        let line = json_line(&report).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(
            line,
            r#"{"status":"failed","msg":"status:running, pid:7, pid exists:false"}"#
        );
    }

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_CONFIG_ERROR,
            EXIT_STATE_ERROR,
            EXIT_SUPERVISOR_ERROR,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn pg_ctl_targets_configured_data_dir() {
        let mut config = KeeperConfig::default();
        config.paths.data_dir = PathBuf::from("/srv/data");
        config.engine.switch_user = false;
        let ctx = Context::new(config, None, HashMap::new(), false);
        assert_eq!(
            ctx.pg_ctl().status_command(),
            "/u01/polardbmpd/bin/pg_ctl status -D '/srv/data'"
        );
    }
}
