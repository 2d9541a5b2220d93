use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use keel_core::{ReleaseManifest, VersionDescriptor};
use keel_planner::{ReleaseSource, ResolvedRelease};
use keel_security::verify_release_signature;
use tracing::{debug, warn};

pub const RELEASE_MANIFEST_FILE: &str = "release.toml";
pub const RELEASE_SIGNATURE_FILE: &str = "release.toml.sig";

/// Releases laid out as `<root>/<version>/release.toml` on local disk.
#[derive(Debug, Clone)]
pub struct DirectoryReleaseSource {
    root: PathBuf,
    trusted_key_hex: Option<String>,
}

impl DirectoryReleaseSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            trusted_key_hex: None,
        }
    }

    /// Require every release to carry a signature made with this key.
    pub fn with_trusted_key(mut self, key_hex: impl Into<String>) -> Self {
        self.trusted_key_hex = Some(key_hex.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn release_dirs(&self) -> Result<Vec<(VersionDescriptor, PathBuf)>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read release directory {}", self.root.display())
                });
            }
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read {}", self.root.display()))?;
            let path = entry.path();
            if !path.join(RELEASE_MANIFEST_FILE).is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(VersionDescriptor::parse) {
                Some(Ok(version)) => dirs.push((version, path)),
                _ => debug!(path = %path.display(), "ignoring release directory with a non-version name"),
            }
        }
        Ok(dirs)
    }

    fn load_release(&self, dir: &Path) -> Result<ResolvedRelease> {
        let manifest_path = dir.join(RELEASE_MANIFEST_FILE);
        let raw = fs::read(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;

        if let Some(key) = &self.trusted_key_hex {
            let signature_path = dir.join(RELEASE_SIGNATURE_FILE);
            let signature = fs::read_to_string(&signature_path).with_context(|| {
                format!(
                    "release is not signed; expected {}",
                    signature_path.display()
                )
            })?;
            verify_release_signature(&raw, key, &signature)
                .with_context(|| format!("untrusted release {}", dir.display()))?;
        }

        let text = String::from_utf8(raw)
            .with_context(|| format!("{} is not valid UTF-8", manifest_path.display()))?;
        let manifest = ReleaseManifest::from_toml_str(&text)
            .with_context(|| format!("invalid release manifest {}", manifest_path.display()))?;
        Ok(ResolvedRelease {
            manifest,
            root: dir.to_path_buf(),
        })
    }
}

impl ReleaseSource for DirectoryReleaseSource {
    fn available_versions(&self) -> Result<Vec<VersionDescriptor>> {
        let mut versions = Vec::new();
        for (version, dir) in self.release_dirs()? {
            match self.load_release(&dir) {
                Ok(_) => versions.push(version),
                Err(err) => warn!(
                    version = %version,
                    error = %format!("{err:#}"),
                    "skipping unusable release"
                ),
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn release(&self, version: &VersionDescriptor) -> Result<Option<ResolvedRelease>> {
        let Some((_, dir)) = self
            .release_dirs()?
            .into_iter()
            .find(|(candidate, _)| candidate.same_precedence(version))
        else {
            return Ok(None);
        };

        let release = self.load_release(&dir)?;
        if !release.manifest.version.same_precedence(version) {
            return Err(anyhow!(
                "release directory {} declares version {}",
                dir.display(),
                release.manifest.version
            ));
        }
        Ok(Some(release))
    }
}
