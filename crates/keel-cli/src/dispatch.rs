use anyhow::Result;
use keel_core::find_install_error;
use keel_installer::{default_user_prefix, DirectoryReleaseSource, InstallLayout};

use crate::command_flows::{
    run_abort_command, run_install_command, run_repair_command, run_resume_command,
    run_rollback_command, run_status_command, run_upgrade_command, run_version_command,
};
use crate::completion::write_completions_script;
use crate::config::{load_config_file, ConfigOverrides, EffectiveConfig};
use crate::render::{current_output_style, TerminalRenderer};
use crate::{Cli, Commands};

/// Everything a state-changing command needs once flags and config are merged.
pub(crate) struct CommandContext {
    pub(crate) layout: InstallLayout,
    pub(crate) config: EffectiveConfig,
    pub(crate) renderer: TerminalRenderer,
}

impl CommandContext {
    pub(crate) fn release_source(&self) -> DirectoryReleaseSource {
        let source = DirectoryReleaseSource::new(&self.config.releases_root);
        match &self.config.trusted_release_key {
            Some(key) => source.with_trusted_key(key.clone()),
            None => source,
        }
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let prefix = match cli.prefix.clone() {
        Some(prefix) => prefix,
        None => default_user_prefix()?,
    };
    let layout = InstallLayout::new(prefix);
    let renderer = TerminalRenderer::from_style(current_output_style());

    match cli.command {
        Commands::Status => return run_status_command(&layout, renderer),
        Commands::Version => return run_version_command(&layout),
        _ => {}
    }

    let ctx = build_context(&cli, layout, renderer)?;
    match cli.command {
        Commands::Install { version } => run_install_command(&ctx, &version),
        Commands::Upgrade { requirement } => run_upgrade_command(&ctx, requirement.as_deref()),
        Commands::Rollback { version } => run_rollback_command(&ctx, &version),
        Commands::Resume => run_resume_command(&ctx),
        Commands::Abort => run_abort_command(&ctx),
        Commands::Repair => run_repair_command(&ctx),
        Commands::Status | Commands::Version | Commands::Completions { .. } => Ok(()),
    }
}

fn build_context(
    cli: &Cli,
    layout: InstallLayout,
    renderer: TerminalRenderer,
) -> Result<CommandContext> {
    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (layout.config_path(), false),
    };
    let file = load_config_file(&config_path, explicit)?;
    let overrides = ConfigOverrides {
        releases_root: cli.releases.clone(),
        lock_timeout_secs: cli.lock_timeout_secs,
    };
    let config = EffectiveConfig::resolve(file, overrides, layout.prefix());
    tracing::debug!(
        prefix = %layout.prefix().display(),
        releases = %config.releases_root.display(),
        config = %config_path.display(),
        "resolved configuration"
    );

    Ok(CommandContext {
        layout,
        config,
        renderer,
    })
}

/// Maps an error to its exit code and the lines printed to stderr.
pub(crate) fn classify_error(err: &anyhow::Error) -> (u8, Vec<String>) {
    match find_install_error(err) {
        Some(install_error) => {
            let mut lines = vec![format!("error: {install_error}")];
            if let Some(hint) = install_error.recovery_hint() {
                lines.push(format!("hint: {hint}"));
            }
            (install_error.exit_code(), lines)
        }
        None => (1, vec![format!("error: {err:#}")]),
    }
}

pub(crate) fn report_error(err: &anyhow::Error) -> u8 {
    let (code, lines) = classify_error(err);
    for line in lines {
        eprintln!("{line}");
    }
    code
}
