use super::{fetch, install, stop, Context};
use dbkeeper_core::dispatch::{REQUEST_ACTION_KEY, REQUEST_TYPE_KEY};
use dbkeeper_core::{mask_secrets, Action};
use tracing::info;

/// Run the operation named by `srv_opr_type`/`srv_opr_action`.
pub fn run(ctx: &Context) -> Result<u8, String> {
    let get = |key: &str| ctx.env.get(key).map_or("", String::as_str);
    info!(
        "request {}={} {}={}\n{}",
        REQUEST_TYPE_KEY,
        get(REQUEST_TYPE_KEY),
        REQUEST_ACTION_KEY,
        get(REQUEST_ACTION_KEY),
        mask_secrets(&ctx.env).join("\n")
    );
    let action = Action::from_env(&ctx.env).map_err(|e| e.to_string())?;
    info!("dispatching {action}");

    match action {
        Action::LockStop | Action::LockExpire => stop::stop(ctx, true),
        Action::UnlockStart | Action::UnlockExpire => stop::start(ctx),
        Action::Restart => stop::restart(ctx),
        Action::ProcessCleanup | Action::GracefulStop => stop::process_cleanup(ctx),
        Action::SetupInstall => install::run(ctx, "manager"),
        Action::RebuildLocal => install::rebuild_local(ctx),
        Action::FetchWal => fetch::request(ctx),
        Action::FetchWalWorker => fetch::worker(ctx),
        Action::FetchStatus => fetch::fetch_status(ctx),
        Action::DownloadStatus => fetch::download_status(ctx),
    }
}
