use super::{print_outcome, Context};
use dbkeeper_core::{StartOutcome, StopController, StopOutcome};

fn stopped(ctx: &Context, outcome: StopOutcome) -> Result<u8, String> {
    let (result, human) = match outcome {
        StopOutcome::AlreadyStopped => ("already-stopped", "engine was not running"),
        StopOutcome::Stopped => ("stopped", "engine stopped"),
        StopOutcome::ForcedCleanup => ("forced", "engine stopped after forced cleanup"),
    };
    print_outcome(ctx.json, result, human)
}

fn started(ctx: &Context, outcome: StartOutcome) -> Result<u8, String> {
    let (result, human) = match outcome {
        StartOutcome::Unlocked => ("unlocked", "instance unlocked, supervisor will start it"),
        StartOutcome::AlreadyRunning => ("already-running", "engine already running"),
    };
    print_outcome(ctx.json, result, human)
}

pub fn stop(ctx: &Context, create_lock: bool) -> Result<u8, String> {
    let engine = ctx.pg_ctl();
    let controller = StopController::new(&ctx.config, &engine, ctx.runner.as_ref());
    let outcome = controller.stop(create_lock).map_err(|e| e.to_string())?;
    stopped(ctx, outcome)
}

pub fn start(ctx: &Context) -> Result<u8, String> {
    let engine = ctx.pg_ctl();
    let controller = StopController::new(&ctx.config, &engine, ctx.runner.as_ref());
    let outcome = controller.start().map_err(|e| e.to_string())?;
    started(ctx, outcome)
}

pub fn restart(ctx: &Context) -> Result<u8, String> {
    let engine = ctx.pg_ctl();
    let controller = StopController::new(&ctx.config, &engine, ctx.runner.as_ref());
    let outcome = controller.restart().map_err(|e| e.to_string())?;
    started(ctx, outcome)
}

pub fn process_cleanup(ctx: &Context) -> Result<u8, String> {
    let engine = ctx.pg_ctl();
    let controller = StopController::new(&ctx.config, &engine, ctx.runner.as_ref());
    let outcome = controller.process_cleanup().map_err(|e| e.to_string())?;
    stopped(ctx, outcome)
}
