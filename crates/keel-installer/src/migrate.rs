use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{anyhow, Context, Result};
use keel_planner::MigrationSpec;
use tracing::info;

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::InstallLayout;

/// What is known about a migration whose step was interrupted while Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationProbe {
    Applied,
    NotApplied,
    /// The command may have run partially; only an operator can tell.
    Unknown,
}

/// Runs migrations for `Migrate` steps and reports on interrupted ones.
pub trait Migrator {
    fn apply(&self, migration: &MigrationSpec) -> Result<()>;

    fn revert(&self, migration: &MigrationSpec) -> Result<()>;

    fn probe(&self, migration: &MigrationSpec) -> Result<MigrationProbe>;
}

impl<T: Migrator + ?Sized> Migrator for &T {
    fn apply(&self, migration: &MigrationSpec) -> Result<()> {
        (**self).apply(migration)
    }

    fn revert(&self, migration: &MigrationSpec) -> Result<()> {
        (**self).revert(migration)
    }

    fn probe(&self, migration: &MigrationSpec) -> Result<MigrationProbe> {
        (**self).probe(migration)
    }
}

/// Runs the release's migration commands, bracketing each with marker files
/// under `state/migrations/` so an interrupted run can be classified.
#[derive(Debug, Clone)]
pub struct CommandMigrator {
    layout: InstallLayout,
}

impl CommandMigrator {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    fn started_marker(&self, id: &str) -> PathBuf {
        self.layout
            .migrations_state_dir()
            .join(format!("{id}.started"))
    }

    fn applied_marker(&self, id: &str) -> PathBuf {
        self.layout
            .migrations_state_dir()
            .join(format!("{id}.applied"))
    }

    /// Clears any earlier outcome for this id and records that a run began.
    pub(crate) fn mark_started(&self, migration: &MigrationSpec) -> Result<()> {
        let dir = self.layout.migrations_state_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let applied = self.applied_marker(&migration.id);
        remove_file_if_exists(&applied)
            .with_context(|| format!("failed to remove {}", applied.display()))?;
        write_atomic(
            &self.started_marker(&migration.id),
            migration.introduced_in.to_string().as_bytes(),
        )
    }

    fn clear_started(&self, migration: &MigrationSpec) -> Result<()> {
        let started = self.started_marker(&migration.id);
        remove_file_if_exists(&started)
            .with_context(|| format!("failed to remove {}", started.display()))
    }

    fn build_command(&self, migration: &MigrationSpec, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("migration '{}' has an empty command", migration.id))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&migration.working_dir)
            .env("KEEL_PREFIX", self.layout.prefix())
            .env("KEEL_MIGRATION_ID", &migration.id);
        Ok(command)
    }
}

impl Migrator for CommandMigrator {
    fn apply(&self, migration: &MigrationSpec) -> Result<()> {
        let mut command = self.build_command(migration, &migration.command)?;
        let context_message = format!("migration '{}' failed", migration.id);
        self.mark_started(migration)?;
        info!(migration = %migration.id, "running migration");

        let output = match command.output() {
            Ok(output) => output,
            Err(err) => {
                self.clear_started(migration)?;
                return Err(err)
                    .with_context(|| format!("{context_message}: command failed to start"));
            }
        };
        if !output.status.success() {
            // Only a command that exited on its own is known to have stopped
            // cleanly; one killed by a signal keeps its started marker.
            if output.status.code().is_some() {
                self.clear_started(migration)?;
            }
            return Err(command_failure(&context_message, &output));
        }

        write_atomic(
            &self.applied_marker(&migration.id),
            migration.introduced_in.to_string().as_bytes(),
        )?;
        self.clear_started(migration)
    }

    fn revert(&self, migration: &MigrationSpec) -> Result<()> {
        if migration.revert.is_empty() {
            return Err(anyhow!(
                "migration '{}' declares no revert command",
                migration.id
            ));
        }
        let mut command = self.build_command(migration, &migration.revert)?;
        info!(migration = %migration.id, "reverting migration");
        run_command(
            &mut command,
            &format!("revert of migration '{}' failed", migration.id),
        )?;

        for marker in [
            self.applied_marker(&migration.id),
            self.started_marker(&migration.id),
        ] {
            remove_file_if_exists(&marker)
                .with_context(|| format!("failed to remove {}", marker.display()))?;
        }
        Ok(())
    }

    fn probe(&self, migration: &MigrationSpec) -> Result<MigrationProbe> {
        if self.applied_marker(&migration.id).exists() {
            return Ok(MigrationProbe::Applied);
        }
        if self.started_marker(&migration.id).exists() {
            return Ok(MigrationProbe::Unknown);
        }
        Ok(MigrationProbe::NotApplied)
    }
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }
    Err(command_failure(context_message, &output))
}

fn command_failure(context_message: &str, output: &Output) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    )
}
