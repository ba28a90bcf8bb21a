use super::{print_outcome, Context};
use dbkeeper_core::{InstallOutcome, InstallSource, Installer};

pub fn run(ctx: &Context, source: &str) -> Result<u8, String> {
    let source = source
        .parse::<InstallSource>()
        .map_err(|e| e.to_string())?;
    let writer = ctx.config_writer();
    let accounts = ctx.accounts();
    let installer = Installer::new(&ctx.config, ctx.runner.as_ref(), &writer, &accounts);
    let outcome = installer.install(source).map_err(|e| e.to_string())?;
    let (result, human) = match outcome {
        InstallOutcome::AlreadyComplete => ("already-complete", "instance already installed"),
        InstallOutcome::InProgressElsewhere => {
            ("in-progress", "installation is running elsewhere")
        }
        InstallOutcome::Installed => ("installed", "instance installed"),
    };
    print_outcome(ctx.json, result, human)
}

pub fn await_completion(ctx: &Context) -> Result<u8, String> {
    let writer = ctx.config_writer();
    let accounts = ctx.accounts();
    Installer::new(&ctx.config, ctx.runner.as_ref(), &writer, &accounts)
        .await_completion()
        .map_err(|e| e.to_string())?;
    print_outcome(ctx.json, "complete", "installation complete")
}

pub fn rebuild_local(ctx: &Context) -> Result<u8, String> {
    let writer = ctx.config_writer();
    let accounts = ctx.accounts();
    Installer::new(&ctx.config, ctx.runner.as_ref(), &writer, &accounts)
        .rebuild_local()
        .map_err(|e| e.to_string())?;
    print_outcome(ctx.json, "rebuilt", "local data directory rebuilt")
}
