use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{InstallError, VersionDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledComponentState {
    pub version: VersionDescriptor,
    pub checksum: String,
    pub install_path: PathBuf,
}

/// Installed components keyed by unique name.
///
/// The manifest is a value: changes produce a new manifest instead of
/// mutating one that is already recorded in an [`InstallationState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ComponentManifest {
    components: BTreeMap<String, InstalledComponentState>,
}

impl ComponentManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&InstalledComponentState> {
        self.components.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstalledComponentState)> {
        self.components.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.components.keys()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn with_component(
        mut self,
        name: impl Into<String>,
        state: InstalledComponentState,
    ) -> Self {
        self.components.insert(name.into(), state);
        self
    }
}

impl FromIterator<(String, InstalledComponentState)> for ComponentManifest {
    fn from_iter<I: IntoIterator<Item = (String, InstalledComponentState)>>(iter: I) -> Self {
        Self {
            components: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Stable,
    InProgress,
    Failed,
}

impl InstallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single durable record describing one installed instance.
///
/// Status moves are expressed as consuming methods so that only the legal
/// transitions can be written down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallationState {
    current_version: VersionDescriptor,
    manifest: ComponentManifest,
    last_transition_id: Option<String>,
    status: InstallStatus,
}

impl InstallationState {
    pub fn new(current_version: VersionDescriptor, manifest: ComponentManifest) -> Self {
        Self {
            current_version,
            manifest,
            last_transition_id: None,
            status: InstallStatus::Stable,
        }
    }

    /// State of a prefix where nothing has been installed yet.
    pub fn empty() -> Self {
        Self::new(VersionDescriptor::ZERO, ComponentManifest::new())
    }

    pub fn is_empty_install(&self) -> bool {
        self.manifest.is_empty() && self.current_version == VersionDescriptor::ZERO
    }

    pub fn current_version(&self) -> &VersionDescriptor {
        &self.current_version
    }

    pub fn manifest(&self) -> &ComponentManifest {
        &self.manifest
    }

    pub fn last_transition_id(&self) -> Option<&str> {
        self.last_transition_id.as_deref()
    }

    pub fn status(&self) -> InstallStatus {
        self.status
    }

    pub fn begin_transition(self, txid: &str) -> Result<Self, InstallError> {
        if self.status != InstallStatus::Stable {
            return Err(InstallError::InvalidTransition {
                from: self.current_version.to_string(),
                to: "?".to_string(),
                reason: format!(
                    "installation is {} (transition {}); it must be resolved first",
                    self.status,
                    self.last_transition_id.as_deref().unwrap_or("unknown")
                ),
            });
        }
        Ok(Self {
            last_transition_id: Some(txid.to_string()),
            status: InstallStatus::InProgress,
            ..self
        })
    }

    pub fn complete_transition(
        self,
        current_version: VersionDescriptor,
        manifest: ComponentManifest,
    ) -> Self {
        Self {
            current_version,
            manifest,
            last_transition_id: self.last_transition_id,
            status: InstallStatus::Stable,
        }
    }

    /// Return to `previous` after a rollback, keeping the transition id for audit.
    pub fn rolled_back_to(self, previous: &InstallationState) -> Self {
        Self {
            current_version: previous.current_version.clone(),
            manifest: previous.manifest.clone(),
            last_transition_id: self.last_transition_id,
            status: InstallStatus::Stable,
        }
    }

    pub fn mark_failed(self) -> Self {
        Self {
            status: InstallStatus::Failed,
            ..self
        }
    }

    /// Clear a Failed status after an operator verified the installation.
    pub fn mark_repaired(self) -> Self {
        Self {
            status: InstallStatus::Stable,
            ..self
        }
    }
}
