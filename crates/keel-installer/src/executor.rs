use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use keel_core::{InstallError, InstallStatus, InstallationState};
use keel_planner::{current_unix_timestamp, MigrationSpec, Step, StepKind, TransitionPlan};
use keel_security::verify_sha256_dir;
use tracing::{debug, info, warn};

use crate::backups::BackupStore;
use crate::checkpoint::{
    append_journal_entry, next_journal_seq, read_checkpoint, write_checkpoint, Checkpoint,
    CheckpointStatus, JournalEntry, StepState,
};
use crate::fs_utils::{
    copy_dir_recursive, move_dir_or_copy, remove_dir_if_exists, remove_file_if_exists, write_atomic,
};
use crate::migrate::{MigrationProbe, Migrator};
use crate::{InstallLayout, InstallLock, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Extra attempts for a failing idempotent step before rolling back.
    pub step_retries: u32,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self { step_retries: 1 }
    }
}

/// Cooperative cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Progress callbacks. All methods default to doing nothing.
pub trait ExecutionObserver {
    fn transition_started(&self, _plan: &TransitionPlan, _first_step: usize) {}

    fn step_started(&self, _index: usize, _step: &Step) {}

    fn step_committed(&self, _index: usize, _step: &Step) {}

    fn step_rolled_back(&self, _index: usize, _step: &Step) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

static NOOP_OBSERVER: NoopObserver = NoopObserver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed(InstallationState),
    /// Stopped on request; the transition stays in progress and can be resumed.
    Cancelled { next_step: usize },
    /// The transition was undone and the prior state restored.
    RolledBack(InstallationState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub state: InstallationState,
    /// Components whose live contents do not match the recorded checksum.
    pub mismatched: Vec<String>,
}

impl RepairReport {
    pub fn repaired(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Applies transition plans step by step, writing a checkpoint ahead of
/// every step state change so a crash can be resumed or rolled back.
pub struct LifecycleExecutor<'a, M> {
    store: &'a StateStore,
    lock: &'a InstallLock,
    migrator: M,
    options: ExecutorOptions,
    cancel: CancelToken,
    observer: &'a dyn ExecutionObserver,
}

impl<'a, M: Migrator> LifecycleExecutor<'a, M> {
    /// Holding `lock` is what makes this the single writer for the prefix.
    pub fn new(
        store: &'a StateStore,
        lock: &'a InstallLock,
        migrator: M,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            store,
            lock,
            migrator,
            options,
            cancel: CancelToken::new(),
            observer: &NOOP_OBSERVER,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn ExecutionObserver) -> Self {
        self.observer = observer;
        self
    }

    fn layout(&self) -> &InstallLayout {
        self.store.layout()
    }

    pub fn execute(&self, plan: TransitionPlan) -> Result<ExecutionOutcome> {
        let current = self
            .store
            .load_optional()?
            .unwrap_or_else(InstallationState::empty);

        if plan.is_empty() {
            debug!(txid = %plan.id, "nothing to do");
            return Ok(ExecutionOutcome::Completed(current));
        }
        if !plan.from.same_precedence(current.current_version()) {
            return Err(InstallError::InvalidTransition {
                from: current.current_version().to_string(),
                to: plan.to.to_string(),
                reason: format!(
                    "plan {} was made for version {}; plan again",
                    plan.id, plan.from
                ),
            }
            .into());
        }

        let state = current.clone().begin_transition(&plan.id)?;
        self.layout().ensure_base_dirs()?;
        let staging = self.layout().transaction_staging_path(&plan.id);
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        let prior_active = read_active_version(self.layout())?;
        let checkpoint = Checkpoint::new(plan, current, prior_active)?;
        write_checkpoint(self.layout(), &checkpoint)?;
        self.journal(
            &checkpoint.txid,
            None,
            "transition",
            CheckpointStatus::Applying.as_str(),
        )?;
        self.store.save(&state)?;

        info!(
            txid = %checkpoint.txid,
            operation = %self.lock.lease().operation,
            direction = %checkpoint.plan.direction,
            from = %checkpoint.plan.from,
            to = %checkpoint.plan.to,
            steps = checkpoint.plan.steps.len(),
            "starting transition"
        );
        self.run_from(checkpoint, state)
    }

    /// Continues the transition recorded in the state's checkpoint from the
    /// first step that is not committed.
    pub fn resume(&self) -> Result<ExecutionOutcome> {
        let (state, mut checkpoint) = self.load_in_progress("resume")?;

        match checkpoint.status {
            CheckpointStatus::Committed => {
                info!(txid = %checkpoint.txid, "finishing committed transition");
                return self.finish(&checkpoint, state).map(ExecutionOutcome::Completed);
            }
            CheckpointStatus::RolledBack => {
                let restored = state.rolled_back_to(&checkpoint.prior_state);
                self.store.save(&restored)?;
                return Ok(ExecutionOutcome::RolledBack(restored));
            }
            CheckpointStatus::Failed => {
                let failed = state.mark_failed();
                self.store.save(&failed)?;
                let cause = checkpoint
                    .failure
                    .clone()
                    .unwrap_or_else(|| "transition failed".to_string());
                let index = failed_step_index(&checkpoint);
                return Err(step_failure(&checkpoint, index, cause, false));
            }
            CheckpointStatus::RollingBack => {
                info!(txid = %checkpoint.txid, "finishing interrupted rollback");
                let index = failed_step_index(&checkpoint);
                let cause = checkpoint
                    .failure
                    .clone()
                    .unwrap_or_else(|| "transition failed".to_string());
                return self.roll_back_and_report(checkpoint, state, index, cause);
            }
            CheckpointStatus::Applying => {}
        }

        if let Some(index) = checkpoint.first_uncommitted() {
            let step = checkpoint.plan.steps[index].clone();
            if checkpoint.step_states[index] == StepState::Running && !step.idempotent {
                let migration = self.migration_for(&checkpoint, &step)?;
                match self.migrator.probe(migration)? {
                    MigrationProbe::Applied => {
                        info!(index, step = %step, "interrupted step had completed");
                        self.commit_step(&mut checkpoint, index, &step)?;
                    }
                    MigrationProbe::NotApplied => {
                        info!(index, step = %step, "interrupted step had not started; re-running");
                        checkpoint.step_states[index] = StepState::Pending;
                        write_checkpoint(self.layout(), &checkpoint)?;
                    }
                    MigrationProbe::Unknown => {
                        let cause = format!(
                            "{step} was interrupted and its effect cannot be determined"
                        );
                        warn!(txid = %checkpoint.txid, index, "transition needs operator attention");
                        self.mark_step_failed(&mut checkpoint, index, &step, &cause)?;
                        return self.roll_back_and_report(checkpoint, state, index, cause);
                    }
                }
            }
        }

        info!(
            txid = %checkpoint.txid,
            next_step = checkpoint.first_uncommitted().unwrap_or(checkpoint.plan.steps.len()),
            "resuming transition"
        );
        self.run_from(checkpoint, state)
    }

    /// Undoes an in-progress transition instead of resuming it.
    pub fn abort(&self) -> Result<ExecutionOutcome> {
        let (state, mut checkpoint) = self.load_in_progress("abort")?;
        if checkpoint.status == CheckpointStatus::Committed {
            return Err(InstallError::InvalidTransition {
                from: checkpoint.plan.from.to_string(),
                to: checkpoint.plan.to.to_string(),
                reason: format!(
                    "transition {} already committed; run `keelctl resume` to finish it",
                    checkpoint.txid
                ),
            }
            .into());
        }

        info!(txid = %checkpoint.txid, "aborting transition");
        let upper = last_touched_step(&checkpoint);
        checkpoint.status = CheckpointStatus::RollingBack;
        checkpoint.failure = Some("aborted by operator".to_string());
        write_checkpoint(self.layout(), &checkpoint)?;

        match self.roll_back(&mut checkpoint, upper) {
            Ok(()) => Ok(ExecutionOutcome::RolledBack(
                self.finish_rollback(&mut checkpoint, state)?,
            )),
            Err(err) => {
                let cause = format!("abort failed: {err:#}");
                self.record_failed(&mut checkpoint, state, cause.clone())?;
                Err(step_failure(
                    &checkpoint,
                    upper.unwrap_or_default(),
                    cause,
                    false,
                ))
            }
        }
    }

    /// Re-verifies every recorded component of a Failed installation and
    /// returns it to Stable when all of them match.
    pub fn repair(&self) -> Result<RepairReport> {
        let state = self.store.load()?;
        match state.status() {
            InstallStatus::Failed => {}
            InstallStatus::Stable => {
                return Err(InstallError::InvalidTransition {
                    from: state.current_version().to_string(),
                    to: state.current_version().to_string(),
                    reason: "installation is stable; there is nothing to repair".to_string(),
                }
                .into());
            }
            InstallStatus::InProgress => {
                return Err(InstallError::InvalidTransition {
                    from: state.current_version().to_string(),
                    to: state.current_version().to_string(),
                    reason: "a transition is in progress; run `keelctl resume` or `keelctl abort`"
                        .to_string(),
                }
                .into());
            }
        }

        let mut mismatched = Vec::new();
        for (name, component) in state.manifest().iter() {
            let matches = component.install_path.is_dir()
                && verify_sha256_dir(&component.install_path, &component.checksum)?;
            if !matches {
                warn!(component = %name, "component does not match its recorded checksum");
                mismatched.push(name.clone());
            }
        }
        if !mismatched.is_empty() {
            return Ok(RepairReport { state, mismatched });
        }

        write_active_version(self.layout(), &state.current_version().to_string())?;
        let repaired = state.mark_repaired();
        self.store.save(&repaired)?;
        info!(version = %repaired.current_version(), "installation repaired");
        Ok(RepairReport {
            state: repaired,
            mismatched,
        })
    }

    fn load_in_progress(&self, action: &str) -> Result<(InstallationState, Checkpoint)> {
        let state = self.store.load()?;
        if state.status() != InstallStatus::InProgress {
            let hint = if state.status() == InstallStatus::Failed {
                "; run `keelctl repair`"
            } else {
                ""
            };
            return Err(InstallError::InvalidTransition {
                from: state.current_version().to_string(),
                to: state.current_version().to_string(),
                reason: format!(
                    "cannot {action}: installation is {}, not in progress{hint}",
                    state.status()
                ),
            }
            .into());
        }

        let txid = state
            .last_transition_id()
            .ok_or_else(|| InstallError::Corruption {
                reason: "in-progress state does not name its transition".to_string(),
            })?
            .to_string();
        let checkpoint =
            read_checkpoint(self.layout(), &txid)?.ok_or_else(|| InstallError::Corruption {
                reason: format!("checkpoint for transition {txid} is missing"),
            })?;
        Ok((state, checkpoint))
    }

    fn run_from(
        &self,
        mut checkpoint: Checkpoint,
        state: InstallationState,
    ) -> Result<ExecutionOutcome> {
        let total = checkpoint.plan.steps.len();
        let mut index = checkpoint.first_uncommitted().unwrap_or(total);
        self.observer.transition_started(&checkpoint.plan, index);

        while index < total {
            if self.cancel.is_cancelled() {
                checkpoint.next_step = index;
                write_checkpoint(self.layout(), &checkpoint)?;
                self.journal(&checkpoint.txid, Some(index), "transition", "cancelled")?;
                info!(txid = %checkpoint.txid, next_step = index, "transition cancelled");
                return Ok(ExecutionOutcome::Cancelled { next_step: index });
            }

            let step = checkpoint.plan.steps[index].clone();
            checkpoint.step_states[index] = StepState::Running;
            checkpoint.next_step = index;
            write_checkpoint(self.layout(), &checkpoint)?;
            self.journal(
                &checkpoint.txid,
                Some(index),
                &step.to_string(),
                StepState::Running.as_str(),
            )?;
            self.observer.step_started(index, &step);
            debug!(index, step = %step, "running step");

            if let Err(err) = self.apply_with_retries(&checkpoint, index, &step) {
                let cause = format!("{err:#}");
                warn!(index, step = %step, error = %cause, "step failed; rolling back");
                self.mark_step_failed(&mut checkpoint, index, &step, &cause)?;
                return self.roll_back_and_report(checkpoint, state, index, cause);
            }

            self.commit_step(&mut checkpoint, index, &step)?;
            index += 1;
        }

        self.finish(&checkpoint, state).map(ExecutionOutcome::Completed)
    }

    fn commit_step(&self, checkpoint: &mut Checkpoint, index: usize, step: &Step) -> Result<()> {
        checkpoint.step_states[index] = StepState::Committed;
        checkpoint.next_step = index + 1;
        write_checkpoint(self.layout(), checkpoint)?;
        self.journal(
            &checkpoint.txid,
            Some(index),
            &step.to_string(),
            StepState::Committed.as_str(),
        )?;
        self.observer.step_committed(index, step);
        Ok(())
    }

    fn mark_step_failed(
        &self,
        checkpoint: &mut Checkpoint,
        index: usize,
        step: &Step,
        cause: &str,
    ) -> Result<()> {
        checkpoint.step_states[index] = StepState::Failed;
        checkpoint.status = CheckpointStatus::RollingBack;
        checkpoint.failure = Some(cause.to_string());
        write_checkpoint(self.layout(), checkpoint)?;
        self.journal(
            &checkpoint.txid,
            Some(index),
            &step.to_string(),
            StepState::Failed.as_str(),
        )
    }

    fn finish(
        &self,
        checkpoint: &Checkpoint,
        state: InstallationState,
    ) -> Result<InstallationState> {
        let mut committed = checkpoint.clone();
        committed.status = CheckpointStatus::Committed;
        committed.next_step = committed.plan.steps.len();
        write_checkpoint(self.layout(), &committed)?;

        let finished = state.complete_transition(
            committed.plan.to.clone(),
            committed.plan.resulting_manifest.clone(),
        );
        self.store.save(&finished)?;
        self.journal(
            &committed.txid,
            None,
            "transition",
            CheckpointStatus::Committed.as_str(),
        )?;
        self.discard_staging(&committed.txid);
        info!(
            txid = %committed.txid,
            version = %finished.current_version(),
            "transition committed"
        );
        Ok(finished)
    }

    fn roll_back_and_report(
        &self,
        mut checkpoint: Checkpoint,
        state: InstallationState,
        failed_index: usize,
        cause: String,
    ) -> Result<ExecutionOutcome> {
        let upper = last_touched_step(&checkpoint);
        match self.roll_back(&mut checkpoint, upper) {
            Ok(()) => {
                self.finish_rollback(&mut checkpoint, state)?;
                Err(step_failure(&checkpoint, failed_index, cause, true))
            }
            Err(rollback_err) => {
                let cause = format!("{cause}; rollback failed: {rollback_err:#}");
                self.record_failed(&mut checkpoint, state, cause.clone())?;
                Err(step_failure(&checkpoint, failed_index, cause, false))
            }
        }
    }

    fn finish_rollback(
        &self,
        checkpoint: &mut Checkpoint,
        state: InstallationState,
    ) -> Result<InstallationState> {
        checkpoint.status = CheckpointStatus::RolledBack;
        write_checkpoint(self.layout(), checkpoint)?;
        let restored = state.rolled_back_to(&checkpoint.prior_state);
        self.store.save(&restored)?;
        self.journal(
            &checkpoint.txid,
            None,
            "transition",
            CheckpointStatus::RolledBack.as_str(),
        )?;
        self.discard_staging(&checkpoint.txid);
        info!(
            txid = %checkpoint.txid,
            version = %restored.current_version(),
            "transition rolled back"
        );
        Ok(restored)
    }

    fn record_failed(
        &self,
        checkpoint: &mut Checkpoint,
        state: InstallationState,
        cause: String,
    ) -> Result<()> {
        warn!(txid = %checkpoint.txid, error = %cause, "rollback failed; installation marked failed");
        checkpoint.status = CheckpointStatus::Failed;
        checkpoint.failure = Some(cause);
        write_checkpoint(self.layout(), checkpoint)?;
        self.store.save(&state.mark_failed())?;
        self.journal(
            &checkpoint.txid,
            None,
            "transition",
            CheckpointStatus::Failed.as_str(),
        )?;
        Ok(())
    }

    /// Undoes every touched step from `upper` down to the first, newest first.
    ///
    /// A step that never committed and cannot be undone is left as it is and
    /// the steps below it are still undone; its error is returned once the
    /// walk finishes. A committed step that cannot be undone stops the walk.
    fn roll_back(&self, checkpoint: &mut Checkpoint, upper: Option<usize>) -> Result<()> {
        let Some(upper) = upper else {
            return Ok(());
        };
        let mut unresolved: Option<anyhow::Error> = None;
        for index in (0..=upper).rev() {
            let step_state = checkpoint.step_states[index];
            if matches!(step_state, StepState::Pending | StepState::RolledBack) {
                continue;
            }
            let step = checkpoint.plan.steps[index].clone();
            let partial = step_state != StepState::Committed;
            if let Err(err) = self.undo_step(checkpoint, &step, partial) {
                let err = err.context(format!("failed to undo step {index} ({step})"));
                if !partial {
                    return Err(err);
                }
                warn!(index, step = %step, error = %format!("{err:#}"), "step left unresolved");
                unresolved.get_or_insert(err);
                continue;
            }
            if step_state != StepState::Failed {
                checkpoint.step_states[index] = StepState::RolledBack;
            }
            write_checkpoint(self.layout(), checkpoint)?;
            self.journal(
                &checkpoint.txid,
                Some(index),
                &step.to_string(),
                StepState::RolledBack.as_str(),
            )?;
            self.observer.step_rolled_back(index, &step);
            debug!(index, step = %step, "step rolled back");
        }
        match unresolved {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_with_retries(&self, checkpoint: &Checkpoint, index: usize, step: &Step) -> Result<()> {
        let attempts = if step.idempotent {
            1 + self.options.step_retries
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            match self.apply_step(checkpoint, step) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    warn!(index, step = %step, attempt, error = %format!("{err:#}"), "retrying step");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn apply_step(&self, checkpoint: &Checkpoint, step: &Step) -> Result<()> {
        match step.kind {
            StepKind::Backup => {
                BackupStore::new(self.layout())
                    .create_snapshot(&checkpoint.prior_state, &checkpoint.txid)?;
                Ok(())
            }
            StepKind::Replace => self.apply_replace(checkpoint, &step.target),
            StepKind::Migrate => {
                let migration = self.migration_for(checkpoint, step)?;
                self.migrator.apply(migration)
            }
            StepKind::Verify => self.apply_verify(checkpoint),
            StepKind::Activate => write_active_version(self.layout(), &step.target),
            StepKind::Remove => self.apply_remove(checkpoint, &step.target),
        }
    }

    fn undo_step(&self, checkpoint: &Checkpoint, step: &Step, partial: bool) -> Result<()> {
        match step.kind {
            StepKind::Backup | StepKind::Verify => Ok(()),
            StepKind::Replace => self.undo_replace(checkpoint, &step.target),
            StepKind::Migrate => {
                let migration = self.migration_for(checkpoint, step)?;
                if partial {
                    match self.migrator.probe(migration)? {
                        MigrationProbe::NotApplied => return Ok(()),
                        MigrationProbe::Applied => {}
                        MigrationProbe::Unknown => {
                            return Err(anyhow!(
                                "migration '{}' was interrupted and cannot be reverted safely",
                                migration.id
                            ));
                        }
                    }
                }
                self.migrator.revert(migration)
            }
            StepKind::Activate => match &checkpoint.prior_active {
                Some(previous) => write_active_version(self.layout(), previous),
                None => {
                    let path = self.layout().active_version_path();
                    remove_file_if_exists(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))
                }
            },
            StepKind::Remove => self.undo_remove(checkpoint, &step.target),
        }
    }

    fn apply_replace(&self, checkpoint: &Checkpoint, name: &str) -> Result<()> {
        let payload = checkpoint
            .plan
            .payloads
            .get(name)
            .ok_or_else(|| anyhow!("plan has no payload for component '{name}'"))?;
        let live = self.live_path(checkpoint, name);
        let incoming = self.staging_path(checkpoint, "incoming", name);
        let displaced = self.staging_path(checkpoint, "displaced", name);

        remove_dir_if_exists(&incoming)?;
        copy_dir_recursive(&payload.source, &incoming).with_context(|| {
            format!(
                "failed to stage component '{name}' from {}",
                payload.source.display()
            )
        })?;
        if !verify_sha256_dir(&incoming, &payload.checksum)? {
            return Err(anyhow!(
                "staged component '{name}' does not match checksum {}",
                payload.checksum
            ));
        }

        if live.exists() {
            if displaced.exists() {
                // An earlier attempt already moved the original aside.
                remove_dir_if_exists(&live)?;
            } else {
                move_dir_or_copy(&live, &displaced)?;
            }
        }
        move_dir_or_copy(&incoming, &live)
    }

    fn undo_replace(&self, checkpoint: &Checkpoint, name: &str) -> Result<()> {
        let live = self.live_path(checkpoint, name);
        let incoming = self.staging_path(checkpoint, "incoming", name);
        let displaced = self.staging_path(checkpoint, "displaced", name);

        remove_dir_if_exists(&incoming)?;
        if displaced.exists() {
            remove_dir_if_exists(&live)?;
            move_dir_or_copy(&displaced, &live)?;
        } else if !checkpoint.prior_state.manifest().contains(name) {
            remove_dir_if_exists(&live)?;
        }
        Ok(())
    }

    fn apply_verify(&self, checkpoint: &Checkpoint) -> Result<()> {
        for (name, component) in checkpoint.plan.resulting_manifest.iter() {
            if !component.install_path.is_dir() {
                return Err(anyhow!(
                    "component '{name}' is missing after replacement"
                ));
            }
            if !verify_sha256_dir(&component.install_path, &component.checksum)? {
                return Err(anyhow!(
                    "component '{name}' does not match checksum {}",
                    component.checksum
                ));
            }
        }
        Ok(())
    }

    fn apply_remove(&self, checkpoint: &Checkpoint, name: &str) -> Result<()> {
        let live = self.prior_path(checkpoint, name);
        let removed = self.staging_path(checkpoint, "removed", name);
        if !live.exists() {
            return Ok(());
        }
        remove_dir_if_exists(&removed)?;
        move_dir_or_copy(&live, &removed)
    }

    fn undo_remove(&self, checkpoint: &Checkpoint, name: &str) -> Result<()> {
        let live = self.prior_path(checkpoint, name);
        let removed = self.staging_path(checkpoint, "removed", name);
        if !removed.exists() {
            return Ok(());
        }
        remove_dir_if_exists(&live)?;
        move_dir_or_copy(&removed, &live)
    }

    fn migration_for<'c>(
        &self,
        checkpoint: &'c Checkpoint,
        step: &Step,
    ) -> Result<&'c MigrationSpec> {
        checkpoint
            .plan
            .migrations
            .get(&step.target)
            .ok_or_else(|| anyhow!("plan has no migration '{}'", step.target))
    }

    fn live_path(&self, checkpoint: &Checkpoint, name: &str) -> PathBuf {
        checkpoint
            .plan
            .resulting_manifest
            .get(name)
            .map(|component| component.install_path.clone())
            .unwrap_or_else(|| self.layout().component_dir(name))
    }

    fn prior_path(&self, checkpoint: &Checkpoint, name: &str) -> PathBuf {
        checkpoint
            .prior_state
            .manifest()
            .get(name)
            .map(|component| component.install_path.clone())
            .unwrap_or_else(|| self.layout().component_dir(name))
    }

    fn staging_path(&self, checkpoint: &Checkpoint, area: &str, name: &str) -> PathBuf {
        self.layout()
            .transaction_staging_path(&checkpoint.txid)
            .join(area)
            .join(name)
    }

    fn discard_staging(&self, txid: &str) {
        let staging = self.layout().transaction_staging_path(txid);
        if let Err(err) = remove_dir_if_exists(&staging) {
            warn!(
                path = %staging.display(),
                error = %format!("{err:#}"),
                "failed to clean transaction staging"
            );
        }
    }

    fn journal(&self, txid: &str, step_index: Option<usize>, step: &str, state: &str) -> Result<()> {
        let entry = JournalEntry {
            seq: next_journal_seq(self.layout(), txid)?,
            step_index,
            step: step.to_string(),
            state: state.to_string(),
            at_unix: current_unix_timestamp()?,
        };
        append_journal_entry(self.layout(), txid, &entry)?;
        Ok(())
    }
}

/// Version named by the active-version marker, if one has been written.
pub fn read_active_version(layout: &InstallLayout) -> Result<Option<String>> {
    let path = layout.active_version_path();
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let version = raw.trim();
            Ok((!version.is_empty()).then(|| version.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read active marker: {}", path.display()))
        }
    }
}

fn write_active_version(layout: &InstallLayout, version: &str) -> Result<()> {
    write_atomic(&layout.active_version_path(), format!("{version}\n").as_bytes())
}

fn last_touched_step(checkpoint: &Checkpoint) -> Option<usize> {
    checkpoint
        .step_states
        .iter()
        .rposition(|state| *state != StepState::Pending)
}

fn failed_step_index(checkpoint: &Checkpoint) -> usize {
    checkpoint
        .step_states
        .iter()
        .position(|state| *state == StepState::Failed)
        .unwrap_or(checkpoint.next_step)
}

fn step_failure(
    checkpoint: &Checkpoint,
    index: usize,
    cause: String,
    rolled_back: bool,
) -> anyhow::Error {
    let (kind, target) = checkpoint
        .step(index)
        .map(|step| (step.kind.to_string(), step.target.clone()))
        .unwrap_or_else(|| ("transition".to_string(), checkpoint.txid.clone()));
    InstallError::StepFailure {
        step_index: index,
        kind,
        target,
        cause,
        rolled_back,
    }
    .into()
}
