use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::VersionDescriptor;

/// Contents of a `release.toml` describing one installable release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseManifest {
    pub version: VersionDescriptor,
    #[serde(default)]
    pub components: BTreeMap<String, ReleaseComponent>,
    #[serde(default)]
    pub migrations: Vec<ReleaseMigration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseComponent {
    /// Defaults to the release version.
    pub version: Option<VersionDescriptor>,
    pub checksum: String,
    /// Payload directory, relative to the release directory.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseMigration {
    pub id: String,
    pub introduced_in: VersionDescriptor,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub revert: Vec<String>,
}

impl ReleaseManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse release manifest")?;

        if manifest.components.is_empty() {
            return Err(anyhow!(
                "release '{}' does not declare any components",
                manifest.version
            ));
        }

        for (name, component) in &manifest.components {
            validate_component_name(name)
                .with_context(|| format!("invalid component in release '{}'", manifest.version))?;
            validate_checksum(&component.checksum).with_context(|| {
                format!(
                    "invalid checksum for component '{name}' in release '{}'",
                    manifest.version
                )
            })?;
            validate_relative_path(&component.path).with_context(|| {
                format!(
                    "invalid payload path for component '{name}' in release '{}'",
                    manifest.version
                )
            })?;
        }

        let mut seen_ids = HashSet::new();
        for migration in &manifest.migrations {
            validate_component_name(&migration.id)
                .with_context(|| format!("invalid migration id '{}'", migration.id))?;
            if !seen_ids.insert(migration.id.as_str()) {
                return Err(anyhow!(
                    "duplicate migration '{}' in release '{}'",
                    migration.id,
                    manifest.version
                ));
            }
            if migration.introduced_in.compare_precedence(&manifest.version)
                == std::cmp::Ordering::Greater
            {
                return Err(anyhow!(
                    "migration '{}' is introduced in {} which is newer than release {}",
                    migration.id,
                    migration.introduced_in,
                    manifest.version
                ));
            }
            if migration.command.is_empty() {
                return Err(anyhow!("migration '{}' declares no command", migration.id));
            }
        }

        Ok(manifest)
    }

    pub fn component_version(&self, name: &str) -> Option<&VersionDescriptor> {
        self.components
            .get(name)
            .map(|component| component.version.as_ref().unwrap_or(&self.version))
    }
}

/// Component names double as directory names under the install prefix.
pub fn validate_component_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(anyhow!(
            "name must be between 1 and 64 characters: '{name}'"
        ));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(anyhow!("name must not start with '.' or '-': '{name}'"));
    }
    if let Some(bad) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
    {
        return Err(anyhow!("name '{name}' contains invalid character '{bad}'"));
    }
    Ok(())
}

fn validate_checksum(checksum: &str) -> anyhow::Result<()> {
    if checksum.len() != 64 || !checksum.chars().all(|ch| matches!(ch, '0'..='9' | 'a'..='f')) {
        return Err(anyhow!(
            "checksum must be 64 lowercase hex characters (sha256): '{checksum}'"
        ));
    }
    Ok(())
}

fn validate_relative_path(path: &str) -> anyhow::Result<()> {
    if path.trim().is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    let candidate = Path::new(path);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!(
            "path must be relative and stay inside the release: '{path}'"
        ));
    }
    Ok(())
}
