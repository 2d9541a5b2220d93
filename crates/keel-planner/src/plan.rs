use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use keel_core::{
    ComponentManifest, InstallError, InstallStatus, InstallationState, InstalledComponentState,
    VersionDescriptor,
};
use tracing::debug;

use crate::{
    BackupIndex, ComponentPayload, MigrationSpec, ReleaseSource, Step, StepKind,
    TransitionDirection, TransitionPlan,
};

pub const VERIFY_TARGET: &str = "installation";

static TRANSITION_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct TransitionPlanner<'a, R, B> {
    releases: &'a R,
    backups: &'a B,
    components_dir: PathBuf,
}

impl<'a, R: ReleaseSource, B: BackupIndex> TransitionPlanner<'a, R, B> {
    pub fn new(releases: &'a R, backups: &'a B, components_dir: impl Into<PathBuf>) -> Self {
        Self {
            releases,
            backups,
            components_dir: components_dir.into(),
        }
    }

    pub fn plan(
        &self,
        current: &InstallationState,
        target: &VersionDescriptor,
    ) -> Result<TransitionPlan> {
        let from = current.current_version();
        let ordering = target.compare_precedence(from);

        // A no-op touches nothing, so it is allowed even while a transition is open.
        if ordering == Ordering::Equal {
            return self.empty_plan(current);
        }

        match current.status() {
            InstallStatus::Stable => {}
            InstallStatus::InProgress => {
                return Err(invalid(
                    from,
                    target,
                    format!(
                        "transition {} is still in progress; run `keelctl resume` or `keelctl abort` first",
                        current.last_transition_id().unwrap_or("unknown")
                    ),
                ));
            }
            InstallStatus::Failed => {
                return Err(invalid(
                    from,
                    target,
                    format!(
                        "transition {} failed and needs operator attention; run `keelctl repair` first",
                        current.last_transition_id().unwrap_or("unknown")
                    ),
                ));
            }
        }

        let plan = if ordering == Ordering::Greater {
            self.plan_forward(current, target)?
        } else {
            self.plan_rollback(current, target)?
        };
        debug!(
            txid = %plan.id,
            direction = %plan.direction,
            from = %plan.from,
            to = %plan.to,
            steps = plan.steps.len(),
            "planned transition"
        );
        Ok(plan)
    }

    fn empty_plan(&self, current: &InstallationState) -> Result<TransitionPlan> {
        Ok(TransitionPlan {
            id: next_transition_id()?,
            direction: TransitionDirection::Noop,
            from: current.current_version().clone(),
            to: current.current_version().clone(),
            steps: Vec::new(),
            payloads: BTreeMap::new(),
            migrations: BTreeMap::new(),
            resulting_manifest: current.manifest().clone(),
            created_at_unix: current_unix_timestamp()?,
        })
    }

    fn plan_forward(
        &self,
        current: &InstallationState,
        target: &VersionDescriptor,
    ) -> Result<TransitionPlan> {
        let from = current.current_version();
        let release = self
            .releases
            .release(target)
            .with_context(|| format!("failed to look up release {target}"))?
            .ok_or_else(|| invalid(from, target, format!("no release {target} is available")))?;

        let fresh_install = current.is_empty_install();
        let mut steps = Vec::new();
        if !current.manifest().is_empty() {
            steps.push(Step::new(StepKind::Backup, from.to_string()));
        }

        let mut payloads = BTreeMap::new();
        let mut resulting_manifest = ComponentManifest::new();
        for (name, component) in &release.manifest.components {
            let version = component
                .version
                .clone()
                .unwrap_or_else(|| release.manifest.version.clone());
            let unchanged = current
                .manifest()
                .get(name)
                .is_some_and(|installed| installed.checksum == component.checksum);
            if !unchanged {
                steps.push(Step::new(StepKind::Replace, name.clone()));
                payloads.insert(
                    name.clone(),
                    ComponentPayload {
                        source: release.root.join(&component.path),
                        checksum: component.checksum.clone(),
                        version: version.clone(),
                    },
                );
            }
            resulting_manifest = resulting_manifest.with_component(
                name.clone(),
                InstalledComponentState {
                    version,
                    checksum: component.checksum.clone(),
                    install_path: self.components_dir.join(name),
                },
            );
        }

        let mut migrations = BTreeMap::new();
        if !fresh_install {
            let mut applicable = release
                .manifest
                .migrations
                .iter()
                .filter(|migration| {
                    migration.introduced_in.compare_precedence(from) == Ordering::Greater
                        && migration.introduced_in.compare_precedence(target) != Ordering::Greater
                })
                .collect::<Vec<_>>();
            applicable.sort_by(|a, b| {
                a.introduced_in
                    .compare_precedence(&b.introduced_in)
                    .then_with(|| a.id.cmp(&b.id))
            });
            for migration in applicable {
                steps.push(Step::new(StepKind::Migrate, migration.id.clone()));
                migrations.insert(
                    migration.id.clone(),
                    MigrationSpec {
                        id: migration.id.clone(),
                        introduced_in: migration.introduced_in.clone(),
                        command: migration.command.clone(),
                        revert: migration.revert.clone(),
                        working_dir: release.root.clone(),
                    },
                );
            }
        }

        steps.push(Step::new(StepKind::Verify, VERIFY_TARGET));
        steps.push(Step::new(StepKind::Activate, release.manifest.version.to_string()));
        push_removals(&mut steps, current.manifest(), &resulting_manifest);

        Ok(TransitionPlan {
            id: next_transition_id()?,
            direction: if fresh_install {
                TransitionDirection::Install
            } else {
                TransitionDirection::Upgrade
            },
            from: from.clone(),
            to: release.manifest.version.clone(),
            steps,
            payloads,
            migrations,
            resulting_manifest,
            created_at_unix: current_unix_timestamp()?,
        })
    }

    fn plan_rollback(
        &self,
        current: &InstallationState,
        target: &VersionDescriptor,
    ) -> Result<TransitionPlan> {
        let from = current.current_version();
        let snapshot = self
            .backups
            .snapshot(target)
            .with_context(|| format!("failed to look up backup snapshot for {target}"))?
            .ok_or_else(|| {
                invalid(
                    from,
                    target,
                    format!(
                        "no backup snapshot covers {target}; only versions this installation was upgraded from can be restored"
                    ),
                )
            })?;

        let mut steps = vec![Step::new(StepKind::Backup, from.to_string())];
        let mut payloads = BTreeMap::new();
        let mut resulting_manifest = ComponentManifest::new();
        for (name, component) in snapshot.manifest.iter() {
            let unchanged = current
                .manifest()
                .get(name)
                .is_some_and(|installed| installed.checksum == component.checksum);
            if !unchanged {
                steps.push(Step::new(StepKind::Replace, name.clone()));
                payloads.insert(
                    name.clone(),
                    ComponentPayload {
                        source: snapshot.components_root.join(name),
                        checksum: component.checksum.clone(),
                        version: component.version.clone(),
                    },
                );
            }
            resulting_manifest = resulting_manifest.with_component(
                name.clone(),
                InstalledComponentState {
                    install_path: self.components_dir.join(name),
                    ..component.clone()
                },
            );
        }

        steps.push(Step::new(StepKind::Verify, VERIFY_TARGET));
        steps.push(Step::new(StepKind::Activate, snapshot.version.to_string()));
        push_removals(&mut steps, current.manifest(), &resulting_manifest);

        Ok(TransitionPlan {
            id: next_transition_id()?,
            direction: TransitionDirection::Rollback,
            from: from.clone(),
            to: snapshot.version,
            steps,
            payloads,
            migrations: BTreeMap::new(),
            resulting_manifest,
            created_at_unix: current_unix_timestamp()?,
        })
    }
}

fn push_removals(
    steps: &mut Vec<Step>,
    current: &ComponentManifest,
    resulting: &ComponentManifest,
) {
    for name in current.names() {
        if !resulting.contains(name) {
            steps.push(Step::new(StepKind::Remove, name.clone()));
        }
    }
}

fn invalid(from: &VersionDescriptor, to: &VersionDescriptor, reason: String) -> anyhow::Error {
    InstallError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
        reason,
    }
    .into()
}

pub fn next_transition_id() -> Result<String> {
    let seq = TRANSITION_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
    Ok(format!(
        "tx-{}-{}-{seq}",
        current_unix_timestamp()?,
        std::process::id()
    ))
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
