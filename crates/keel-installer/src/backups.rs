use std::fs;
use std::io;

use anyhow::{anyhow, Context, Result};
use keel_core::{ComponentManifest, InstallationState, VersionDescriptor};
use keel_planner::{current_unix_timestamp, BackupIndex, BackupSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fs_utils::{copy_dir_recursive, remove_dir_if_exists, write_atomic};
use crate::InstallLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotFile {
    version: VersionDescriptor,
    txid: String,
    created_at_unix: u64,
    manifest: ComponentManifest,
}

/// Retained copies of previous installations under `backups/<version>/`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    layout: InstallLayout,
}

impl BackupStore {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    /// Copies every live component of `state` into a snapshot keyed by its
    /// version. The snapshot is assembled next to its final location and
    /// renamed into place, so a half-written snapshot is never visible.
    /// Re-running for the same transaction keeps the existing snapshot.
    pub fn create_snapshot(&self, state: &InstallationState, txid: &str) -> Result<BackupSnapshot> {
        let version = state.current_version();
        let final_dir = self.layout.backup_dir(version);
        if let Some(existing) = self.read_snapshot_dir(version)? {
            if existing.txid == txid {
                debug!(version = %version, txid, "backup snapshot already taken");
                return Ok(existing);
            }
        }

        let backups_dir = self.layout.backups_dir();
        let partial = backups_dir.join(format!(".{version}-{txid}.partial"));
        remove_dir_if_exists(&partial)?;
        let partial_components = partial.join("components");
        fs::create_dir_all(&partial_components)
            .with_context(|| format!("failed to create {}", partial_components.display()))?;

        for (name, component) in state.manifest().iter() {
            if !component.install_path.is_dir() {
                return Err(anyhow!(
                    "component '{name}' is missing from {}; cannot back up {version}",
                    component.install_path.display()
                ));
            }
            copy_dir_recursive(&component.install_path, &partial_components.join(name))
                .with_context(|| format!("failed to back up component '{name}'"))?;
        }

        let record = SnapshotFile {
            version: version.clone(),
            txid: txid.to_string(),
            created_at_unix: current_unix_timestamp()?,
            manifest: state.manifest().clone(),
        };
        let mut bytes =
            serde_json::to_vec_pretty(&record).context("failed to serialize backup snapshot")?;
        bytes.push(b'\n');
        write_atomic(&partial.join("snapshot.json"), &bytes)?;

        if final_dir.exists() {
            let superseded = backups_dir.join(format!(".{version}-{txid}.old"));
            remove_dir_if_exists(&superseded)?;
            fs::rename(&final_dir, &superseded).with_context(|| {
                format!("failed to retire previous snapshot {}", final_dir.display())
            })?;
            fs::rename(&partial, &final_dir)
                .with_context(|| format!("failed to publish snapshot {}", final_dir.display()))?;
            remove_dir_if_exists(&superseded)?;
        } else {
            fs::rename(&partial, &final_dir)
                .with_context(|| format!("failed to publish snapshot {}", final_dir.display()))?;
        }

        info!(
            version = %version,
            txid,
            components = state.manifest().len(),
            "created backup snapshot"
        );
        Ok(self.to_snapshot(record))
    }

    /// All readable snapshots, newest version first.
    pub fn list(&self) -> Result<Vec<BackupSnapshot>> {
        let dir = self.layout.backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Ok(version) = VersionDescriptor::parse(name) else {
                warn!(entry = name, "ignoring backup directory with a non-version name");
                continue;
            };
            match self.read_snapshot_dir(&version) {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(err) => warn!(version = %version, error = %err, "skipping unreadable backup snapshot"),
            }
        }
        snapshots.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(snapshots)
    }

    fn read_snapshot_dir(&self, version: &VersionDescriptor) -> Result<Option<BackupSnapshot>> {
        let path = self.layout.backup_snapshot_path(version);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let record: SnapshotFile = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse backup snapshot {}", path.display()))?;
        if record.version != *version {
            return Err(anyhow!(
                "backup snapshot {} records version {}",
                path.display(),
                record.version
            ));
        }
        Ok(Some(self.to_snapshot(record)))
    }

    fn to_snapshot(&self, record: SnapshotFile) -> BackupSnapshot {
        BackupSnapshot {
            components_root: self.layout.backup_components_dir(&record.version),
            version: record.version,
            manifest: record.manifest,
            txid: record.txid,
            created_at_unix: record.created_at_unix,
        }
    }
}

impl BackupIndex for BackupStore {
    fn snapshot(&self, version: &VersionDescriptor) -> Result<Option<BackupSnapshot>> {
        if let Some(snapshot) = self.read_snapshot_dir(version)? {
            return Ok(Some(snapshot));
        }
        Ok(self
            .list()?
            .into_iter()
            .find(|snapshot| snapshot.version.same_precedence(version)))
    }
}
