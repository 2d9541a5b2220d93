use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use keel_core::{ComponentManifest, VersionDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Backup,
    Replace,
    Migrate,
    Verify,
    Activate,
    Remove,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Replace => "replace",
            Self::Migrate => "migrate",
            Self::Verify => "verify",
            Self::Activate => "activate",
            Self::Remove => "remove",
        }
    }

    /// Migrations run arbitrary commands, so only they are unsafe to repeat.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Migrate)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub target: String,
    pub idempotent: bool,
}

impl Step {
    pub fn new(kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            idempotent: kind.is_idempotent(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDirection {
    Noop,
    Install,
    Upgrade,
    Rollback,
}

impl TransitionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for TransitionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source directory and expected digest for a `Replace` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPayload {
    pub source: PathBuf,
    pub checksum: String,
    pub version: VersionDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSpec {
    pub id: String,
    pub introduced_in: VersionDescriptor,
    pub command: Vec<String>,
    pub revert: Vec<String>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub id: String,
    pub direction: TransitionDirection,
    pub from: VersionDescriptor,
    pub to: VersionDescriptor,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub payloads: BTreeMap<String, ComponentPayload>,
    #[serde(default)]
    pub migrations: BTreeMap<String, MigrationSpec>,
    pub resulting_manifest: ComponentManifest,
    pub created_at_unix: u64,
}

impl TransitionPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(|step| step.kind).collect()
    }
}
