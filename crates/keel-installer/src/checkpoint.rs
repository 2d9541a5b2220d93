use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use keel_core::{InstallError, InstallationState};
use keel_planner::{current_unix_timestamp, Step, TransitionPlan};
use serde::{Deserialize, Serialize};

use crate::fs_utils::write_atomic;
use crate::store::{seal, unseal};
use crate::InstallLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Committed,
    RolledBack,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Applying,
    RollingBack,
    Committed,
    RolledBack,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applying => "applying",
            Self::RollingBack => "rolling_back",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

/// Durable progress record of one transition, written ahead of every step
/// state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub txid: String,
    pub plan: TransitionPlan,
    /// State as it was before the transition began; rollback returns here.
    pub prior_state: InstallationState,
    pub step_states: Vec<StepState>,
    pub next_step: usize,
    pub status: CheckpointStatus,
    /// Contents of the active-version marker before the transition.
    #[serde(default)]
    pub prior_active: Option<String>,
    pub started_at_unix: u64,
    pub updated_at_unix: u64,
    #[serde(default)]
    pub failure: Option<String>,
}

impl Checkpoint {
    pub fn new(
        plan: TransitionPlan,
        prior_state: InstallationState,
        prior_active: Option<String>,
    ) -> Result<Self> {
        let now = current_unix_timestamp()?;
        Ok(Self {
            txid: plan.id.clone(),
            step_states: vec![StepState::Pending; plan.steps.len()],
            plan,
            prior_state,
            next_step: 0,
            status: CheckpointStatus::Applying,
            prior_active,
            started_at_unix: now,
            updated_at_unix: now,
            failure: None,
        })
    }

    /// First step that has not been committed yet.
    pub fn first_uncommitted(&self) -> Option<usize> {
        self.step_states
            .iter()
            .position(|state| *state != StepState::Committed)
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.plan.steps.get(index)
    }
}

pub fn write_checkpoint(layout: &InstallLayout, checkpoint: &Checkpoint) -> Result<PathBuf> {
    let path = layout.checkpoint_path(&checkpoint.txid);
    let mut record = checkpoint.clone();
    record.updated_at_unix = current_unix_timestamp()?;
    let bytes = seal(&record)?;
    write_atomic(&path, &bytes)
        .with_context(|| format!("failed to write checkpoint: {}", path.display()))?;
    Ok(path)
}

pub fn read_checkpoint(layout: &InstallLayout, txid: &str) -> Result<Option<Checkpoint>> {
    let path = layout.checkpoint_path(txid);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read checkpoint: {}", path.display()));
        }
    };

    let checkpoint = unseal::<Checkpoint>(&raw).map_err(|reason| InstallError::Corruption {
        reason: format!("checkpoint for transition {txid}: {reason}"),
    })?;
    if checkpoint.txid != txid {
        return Err(InstallError::Corruption {
            reason: format!(
                "checkpoint for transition {txid} records transition {}",
                checkpoint.txid
            ),
        }
        .into());
    }
    Ok(Some(checkpoint))
}

/// One line of the append-only per-transaction journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub step_index: Option<usize>,
    pub step: String,
    pub state: String,
    pub at_unix: u64,
}

pub fn append_journal_entry(
    layout: &InstallLayout,
    txid: &str,
    entry: &JournalEntry,
) -> Result<PathBuf> {
    let path = layout.journal_path(txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut line = serde_json::to_string(entry).context("failed to serialize journal entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("failed to sync transaction journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_journal(layout: &InstallLayout, txid: &str) -> Result<Vec<JournalEntry>> {
    let path = layout.journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read transaction journal: {}", path.display())
            });
        }
    };

    let mut entries = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A crash can leave a torn final line; anything earlier is real damage.
            Err(_) if line_no + 1 == raw.lines().count() => break,
            Err(err) => {
                return Err(anyhow!(
                    "invalid transaction journal line {} in {}: {err}",
                    line_no + 1,
                    path.display()
                ));
            }
        }
    }
    Ok(entries)
}

/// Sequence number for the next journal line.
pub fn next_journal_seq(layout: &InstallLayout, txid: &str) -> Result<u64> {
    Ok(read_journal(layout, txid)?
        .last()
        .map(|entry| entry.seq + 1)
        .unwrap_or(1))
}
