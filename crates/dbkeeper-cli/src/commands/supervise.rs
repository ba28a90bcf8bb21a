use super::{Context, EXIT_SUPERVISOR_ERROR};
use dbkeeper_core::{Installer, Supervisor};
use dbkeeper_runtime::ShellLauncher;
use tracing::warn;

/// Returns the engine's own exit code once supervision ends.
pub fn run(ctx: &Context, command: &[String]) -> Result<u8, String> {
    let start_command = command.join(" ");
    let engine = ctx.pg_ctl();
    let launcher = ShellLauncher::new();
    let accounts = ctx.accounts();
    let writer = ctx.config_writer();
    let installer = Installer::new(&ctx.config, ctx.runner.as_ref(), &writer, &accounts);

    let mut supervisor = Supervisor::new(
        &ctx.config,
        installer,
        &engine,
        &launcher,
        &accounts,
        ctx.runner.as_ref(),
        start_command,
    );
    let code = supervisor.run().map_err(|e| e.to_string())?;
    Ok(u8::try_from(code).unwrap_or_else(|_| {
        warn!("engine exit code {code} out of range");
        EXIT_SUPERVISOR_ERROR
    }))
}
