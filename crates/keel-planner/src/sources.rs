use std::path::PathBuf;

use anyhow::Result;
use keel_core::{ComponentManifest, ReleaseManifest, VersionDescriptor};

/// A release manifest together with the directory its payload paths are relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub manifest: ReleaseManifest,
    pub root: PathBuf,
}

/// Where installable releases come from. Fetching artifacts is the
/// implementor's business; the planner only reads what is already local.
pub trait ReleaseSource {
    fn available_versions(&self) -> Result<Vec<VersionDescriptor>>;

    fn release(&self, version: &VersionDescriptor) -> Result<Option<ResolvedRelease>>;
}

/// A retained copy of an earlier installation, usable as a rollback target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub version: VersionDescriptor,
    pub manifest: ComponentManifest,
    pub components_root: PathBuf,
    pub txid: String,
    pub created_at_unix: u64,
}

pub trait BackupIndex {
    fn snapshot(&self, version: &VersionDescriptor) -> Result<Option<BackupSnapshot>>;
}
