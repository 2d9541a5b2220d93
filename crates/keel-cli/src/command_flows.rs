use anyhow::Result;
use keel_core::{InstallError, InstallationState, VersionDescriptor};
use keel_installer::{
    read_active_version, read_lease, BackupStore, CommandMigrator, DirectoryReleaseSource,
    ExecutionOutcome, ExecutorOptions, InstallLayout, InstallLock, LifecycleExecutor, StateStore,
};
use keel_planner::{select_target, TransitionPlanner};
use semver::VersionReq;

use crate::dispatch::CommandContext;
use crate::render::{format_plan_lines, format_state_lines, TerminalRenderer};

/// What `upgrade` was asked to move to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpgradeRequest {
    Newest,
    Exact(VersionDescriptor),
    Matching(VersionReq),
}

/// Parses a version typed on the command line; a leading `v` is accepted.
pub(crate) fn parse_target_version(input: &str) -> Result<VersionDescriptor> {
    let trimmed = input.trim();
    let unprefixed = trimmed
        .strip_prefix('v')
        .filter(|rest| rest.starts_with(|ch: char| ch.is_ascii_digit()))
        .unwrap_or(trimmed);
    Ok(VersionDescriptor::parse(unprefixed)?)
}

pub(crate) fn parse_upgrade_request(input: Option<&str>) -> Result<UpgradeRequest> {
    let Some(input) = input else {
        return Ok(UpgradeRequest::Newest);
    };
    if let Ok(version) = parse_target_version(input) {
        return Ok(UpgradeRequest::Exact(version));
    }
    match VersionReq::parse(input.trim()) {
        Ok(requirement) => Ok(UpgradeRequest::Matching(requirement)),
        Err(err) => Err(InstallError::Format {
            input: input.to_string(),
            reason: format!("not a version or version requirement: {err}"),
        }
        .into()),
    }
}

pub(crate) fn run_install_command(ctx: &CommandContext, version: &str) -> Result<()> {
    let target = parse_target_version(version)?;
    with_locked_prefix(ctx, "install", |store, lock| {
        let current = store
            .load_optional()?
            .unwrap_or_else(InstallationState::empty);
        if !current.is_empty_install() && !current.current_version().same_precedence(&target) {
            return Err(invalid_transition(
                &current,
                &target,
                "an installation already exists; use `keelctl upgrade` or `keelctl rollback`",
            ));
        }
        let releases = ctx.release_source();
        apply_transition(ctx, "install", store, lock, &releases, &current, &target)
    })
}

pub(crate) fn run_upgrade_command(ctx: &CommandContext, requirement: Option<&str>) -> Result<()> {
    let request = parse_upgrade_request(requirement)?;
    with_locked_prefix(ctx, "upgrade", |store, lock| {
        let current = store.load()?;
        let releases = ctx.release_source();
        let target = match &request {
            UpgradeRequest::Exact(version) => version.clone(),
            UpgradeRequest::Newest => {
                let Some(newest) = select_target(&releases, None)? else {
                    return Err(no_release(&current, &releases, "no releases are available"));
                };
                if newest.compare_precedence(current.current_version()).is_le() {
                    ctx.renderer.print_status(
                        "ok",
                        &format!("already at the newest release {}", current.current_version()),
                    );
                    return Ok(());
                }
                newest
            }
            UpgradeRequest::Matching(requirement) => {
                match select_target(&releases, Some(requirement))? {
                    Some(version) => version,
                    None => {
                        return Err(no_release(
                            &current,
                            &releases,
                            &format!("no release matches '{requirement}'"),
                        ))
                    }
                }
            }
        };

        if target
            .compare_precedence(current.current_version())
            .is_lt()
        {
            return Err(invalid_transition(
                &current,
                &target,
                "target is older than the installed version; use `keelctl rollback`",
            ));
        }
        apply_transition(ctx, "upgrade", store, lock, &releases, &current, &target)
    })
}

pub(crate) fn run_rollback_command(ctx: &CommandContext, version: &str) -> Result<()> {
    let target = parse_target_version(version)?;
    with_locked_prefix(ctx, "rollback", |store, lock| {
        let current = store.load()?;
        if target
            .compare_precedence(current.current_version())
            .is_gt()
        {
            return Err(invalid_transition(
                &current,
                &target,
                "target is newer than the installed version; use `keelctl upgrade`",
            ));
        }
        let releases = ctx.release_source();
        apply_transition(ctx, "rollback", store, lock, &releases, &current, &target)
    })
}

pub(crate) fn run_resume_command(ctx: &CommandContext) -> Result<()> {
    with_locked_prefix(ctx, "resume", |store, lock| {
        let progress = ctx.renderer.start_progress("resume");
        let outcome = {
            let executor = new_executor(ctx, store, lock).with_observer(&progress);
            executor.resume()
        };
        progress.finish();
        report_outcome(ctx.renderer, "resume", outcome?);
        Ok(())
    })
}

pub(crate) fn run_abort_command(ctx: &CommandContext) -> Result<()> {
    with_locked_prefix(ctx, "abort", |store, lock| {
        let outcome = new_executor(ctx, store, lock).abort()?;
        report_outcome(ctx.renderer, "abort", outcome);
        Ok(())
    })
}

pub(crate) fn run_repair_command(ctx: &CommandContext) -> Result<()> {
    with_locked_prefix(ctx, "repair", |store, lock| {
        let report = new_executor(ctx, store, lock).repair()?;
        if !report.repaired() {
            return Err(InstallError::Corruption {
                reason: format!(
                    "components do not match their recorded checksums: {}",
                    report.mismatched.join(", ")
                ),
            }
            .into());
        }
        ctx.renderer.print_status(
            "ok",
            &format!(
                "repaired: {} verified and marked stable",
                report.state.current_version()
            ),
        );
        Ok(())
    })
}

pub(crate) fn run_status_command(layout: &InstallLayout, renderer: TerminalRenderer) -> Result<()> {
    renderer.print_lines(&status_lines(layout)?);
    Ok(())
}

pub(crate) fn status_lines(layout: &InstallLayout) -> Result<Vec<String>> {
    let store = StateStore::reader(layout);
    let Some(state) = store.load_optional()? else {
        return Ok(vec![format!("not installed ({})", layout.prefix().display())]);
    };

    let active = read_active_version(layout)?;
    let snapshots = BackupStore::new(layout).list()?;
    let mut lines = format_state_lines(&state, active.as_deref(), &snapshots);
    if let Ok(Some(lease)) = read_lease(layout) {
        lines.push(format!(
            "lease: pid {} ({}, since unix {})",
            lease.pid, lease.operation, lease.acquired_at_unix
        ));
    }
    Ok(lines)
}

pub(crate) fn run_version_command(layout: &InstallLayout) -> Result<()> {
    println!("{}", installed_version_line(layout)?);
    Ok(())
}

pub(crate) fn installed_version_line(layout: &InstallLayout) -> Result<String> {
    let store = StateStore::reader(layout);
    Ok(match store.load_optional()? {
        Some(state) if !state.is_empty_install() => state.current_version().to_string(),
        _ => env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn with_locked_prefix<T>(
    ctx: &CommandContext,
    operation: &str,
    run: impl FnOnce(&StateStore, &InstallLock) -> Result<T>,
) -> Result<T> {
    ctx.layout.ensure_base_dirs()?;
    let lock = InstallLock::acquire(&ctx.layout, operation, ctx.config.lock_timeout)?;
    let store = StateStore::open(&ctx.layout)?;
    run(&store, &lock)
}

fn new_executor<'a>(
    ctx: &CommandContext,
    store: &'a StateStore,
    lock: &'a InstallLock,
) -> LifecycleExecutor<'a, CommandMigrator> {
    LifecycleExecutor::new(
        store,
        lock,
        CommandMigrator::new(&ctx.layout),
        ExecutorOptions {
            step_retries: ctx.config.step_retries,
        },
    )
}

fn apply_transition(
    ctx: &CommandContext,
    operation: &str,
    store: &StateStore,
    lock: &InstallLock,
    releases: &DirectoryReleaseSource,
    current: &InstallationState,
    target: &VersionDescriptor,
) -> Result<()> {
    let backups = BackupStore::new(&ctx.layout);
    let plan =
        TransitionPlanner::new(releases, &backups, ctx.layout.components_dir()).plan(current, target)?;
    if plan.is_empty() {
        ctx.renderer
            .print_status("ok", &format!("already at {}", current.current_version()));
        return Ok(());
    }

    ctx.renderer
        .print_section(&format!("{operation} {} -> {}", plan.from, plan.to));
    ctx.renderer.print_lines(&format_plan_lines(&plan));

    let progress = ctx.renderer.start_progress(operation);
    let outcome = {
        let executor = new_executor(ctx, store, lock).with_observer(&progress);
        executor.execute(plan)
    };
    progress.finish();
    report_outcome(ctx.renderer, operation, outcome?);
    Ok(())
}

fn report_outcome(renderer: TerminalRenderer, operation: &str, outcome: ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::Completed(state) => renderer.print_status(
            "ok",
            &format!("{operation} complete: now at {}", state.current_version()),
        ),
        ExecutionOutcome::Cancelled { next_step } => renderer.print_status(
            "warn",
            &format!(
                "{operation} stopped before step {}; run `keelctl resume` to continue",
                next_step + 1
            ),
        ),
        ExecutionOutcome::RolledBack(state) => renderer.print_status(
            "warn",
            &format!(
                "{operation} rolled back; installation remains at {}",
                state.current_version()
            ),
        ),
    }
}

fn invalid_transition(
    current: &InstallationState,
    target: &VersionDescriptor,
    reason: &str,
) -> anyhow::Error {
    InstallError::InvalidTransition {
        from: current.current_version().to_string(),
        to: target.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn no_release(
    current: &InstallationState,
    releases: &DirectoryReleaseSource,
    reason: &str,
) -> anyhow::Error {
    InstallError::InvalidTransition {
        from: current.current_version().to_string(),
        to: "newer release".to_string(),
        reason: format!("{reason} under {}", releases.root().display()),
    }
    .into()
}
