use super::{json_line, print_report, Context, EXIT_SUCCESS};
use dbkeeper_core::FetchJob;
use dbkeeper_runtime::{DetachedSpawner, PsqlExecutor};
use std::sync::Arc;

pub const WORKER_SUBCOMMAND: &str = "fetch-wal-worker";

/// Start the worker in the background; it re-reads the same configuration.
pub fn request(ctx: &Context) -> Result<u8, String> {
    let program = std::env::current_exe().map_err(|e| format!("cannot locate own binary: {e}"))?;
    let mut args = Vec::new();
    if let Some(path) = &ctx.config_path {
        args.push("--config".to_owned());
        args.push(path.display().to_string());
    }
    args.push(WORKER_SUBCOMMAND.to_owned());

    let job = FetchJob::new(&ctx.config, ctx.runner.as_ref());
    let handle = job
        .request(&DetachedSpawner, &program, &args)
        .map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_line(&serde_json::json!({ "worker_pid": handle.pid() }))?);
    } else {
        println!("fetch worker started (pid {})", handle.pid());
    }
    Ok(EXIT_SUCCESS)
}

pub fn worker(ctx: &Context) -> Result<u8, String> {
    let sql = PsqlExecutor::new(Arc::clone(&ctx.runner), &ctx.config.engine.bin_dir);
    let report = FetchJob::new(&ctx.config, ctx.runner.as_ref())
        .run_worker(&sql)
        .map_err(|e| e.to_string())?;
    print_report(&report)
}

pub fn fetch_status(ctx: &Context) -> Result<u8, String> {
    let report = FetchJob::new(&ctx.config, ctx.runner.as_ref())
        .check_fetch_status()
        .map_err(|e| e.to_string())?;
    print_report(&report)
}

pub fn download_status(ctx: &Context) -> Result<u8, String> {
    let report = FetchJob::new(&ctx.config, ctx.runner.as_ref())
        .check_download_status()
        .map_err(|e| e.to_string())?;
    print_report(&report)
}
