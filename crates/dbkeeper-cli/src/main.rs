mod commands;

use clap::{Parser, Subcommand};
use commands::{
    Context, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STATE_ERROR, EXIT_SUPERVISOR_ERROR,
};
use dbkeeper_core::{install_signal_handler, KeeperConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "dbkeeper",
    version,
    about = "Lifecycle supervisor for a containerized database engine"
)]
struct Cli {
    /// TOML configuration file; container environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch the engine and keep supervising it (use -- before the start command).
    Supervise {
        /// Engine start command.
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Install the instance once; later calls are no-ops.
    Install {
        /// Who requested the install: "manager" clears the data directories,
        /// "engine" keeps them.
        #[arg(long, default_value = "manager")]
        source: String,
    },
    /// Block until installation has completed.
    AwaitInstall,
    /// Stop the engine.
    Stop {
        /// Do not leave the stop lock behind.
        #[arg(long, default_value_t = false)]
        no_lock: bool,
    },
    /// Clear the stop lock so the supervisor starts the engine.
    Start,
    /// Stop, then clear the stop lock.
    Restart,
    /// Stop without a lock; the supervisor relaunches the engine.
    ProcessCleanup,
    /// Rebuild the local data directory from shared storage.
    RebuildLocal,
    /// Start a background WAL fetch from the PITR source.
    FetchWal,
    /// Run the WAL fetch in the foreground (spawned by fetch-wal).
    #[command(hide = true)]
    FetchWalWorker,
    /// Report the state of the WAL fetch job.
    FetchStatus,
    /// Report progress of the bulk archive download.
    DownloadStatus,
    /// Run the operation named by srv_opr_type/srv_opr_action.
    Dispatch,
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("configuration error:") {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("required state missing:") {
        EXIT_STATE_ERROR
    } else {
        EXIT_FAILURE
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DBKEEPER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let env: HashMap<String, String> = std::env::vars().collect();
    let config = match KeeperConfig::load(cli.config.as_deref(), &env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let ctx = Context::new(config, cli.config, env, cli.json);

    let result = match &cli.command {
        Commands::Supervise { command } => {
            return match commands::supervise::run(&ctx, command) {
                Ok(code) => ExitCode::from(code),
                Err(msg) => {
                    eprintln!("error: {msg}");
                    ExitCode::from(EXIT_SUPERVISOR_ERROR)
                }
            };
        }
        Commands::Install { source } => commands::install::run(&ctx, source),
        Commands::AwaitInstall => commands::install::await_completion(&ctx),
        Commands::Stop { no_lock } => commands::stop::stop(&ctx, !no_lock),
        Commands::Start => commands::stop::start(&ctx),
        Commands::Restart => commands::stop::restart(&ctx),
        Commands::ProcessCleanup => commands::stop::process_cleanup(&ctx),
        Commands::RebuildLocal => commands::install::rebuild_local(&ctx),
        Commands::FetchWal => commands::fetch::request(&ctx),
        Commands::FetchWalWorker => commands::fetch::worker(&ctx),
        Commands::FetchStatus => commands::fetch::fetch_status(&ctx),
        Commands::DownloadStatus => commands::fetch::download_status(&ctx),
        Commands::Dispatch => commands::dispatch::run(&ctx),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_prefixes_pick_exit_codes() {
        assert_eq!(exit_code_for("configuration error: bad storage_type"), EXIT_CONFIG_ERROR);
        assert_eq!(exit_code_for("store error: I/O error"), EXIT_STATE_ERROR);
        assert_eq!(
            exit_code_for("required state missing: logic_ins_id is not configured"),
            EXIT_STATE_ERROR
        );
        assert_eq!(exit_code_for("installation failed: initdb"), EXIT_FAILURE);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
