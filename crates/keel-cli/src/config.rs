use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STEP_RETRIES: u32 = 1;

/// Contents of `keel.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct KeelConfigFile {
    #[serde(default = "config_file_version")]
    pub(crate) version: u32,
    pub(crate) releases_root: Option<PathBuf>,
    pub(crate) lock_timeout_secs: Option<u64>,
    pub(crate) step_retries: Option<u32>,
    pub(crate) trusted_release_key: Option<String>,
}

pub(crate) fn config_file_version() -> u32 {
    1
}

pub(crate) fn parse_config_file(content: &str) -> Result<KeelConfigFile> {
    let parsed = toml::from_str::<KeelConfigFile>(content).context("failed parsing keel.toml")?;
    let expected = config_file_version();
    if parsed.version != expected {
        anyhow::bail!(
            "unsupported config version {} (expected {expected}): update keel.toml to version {expected}",
            parsed.version
        );
    }
    if let Some(key) = &parsed.trusted_release_key {
        if key.trim().len() != 64 || !key.trim().chars().all(|ch| ch.is_ascii_hexdigit()) {
            anyhow::bail!("trusted_release_key must be 64 hex characters (an Ed25519 public key)");
        }
    }
    Ok(parsed)
}

/// Reads the config at `path`. A missing file is only an error when the
/// path was given explicitly.
pub(crate) fn load_config_file(path: &Path, explicit: bool) -> Result<KeelConfigFile> {
    match fs::read_to_string(path) {
        Ok(content) => parse_config_file(&content)
            .with_context(|| format!("invalid config file: {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => {
            Ok(KeelConfigFile::default_file())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file: {}", path.display()))
        }
    }
}

impl KeelConfigFile {
    fn default_file() -> Self {
        Self {
            version: config_file_version(),
            ..Self::default()
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConfigOverrides {
    pub(crate) releases_root: Option<PathBuf>,
    pub(crate) lock_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EffectiveConfig {
    pub(crate) releases_root: PathBuf,
    pub(crate) lock_timeout: Duration,
    pub(crate) step_retries: u32,
    pub(crate) trusted_release_key: Option<String>,
}

impl EffectiveConfig {
    /// Relative paths in the file are resolved against the prefix; the
    /// default release directory is `<prefix>/releases`.
    pub(crate) fn resolve(file: KeelConfigFile, overrides: ConfigOverrides, prefix: &Path) -> Self {
        let releases_root = overrides
            .releases_root
            .or_else(|| {
                file.releases_root.map(|root| {
                    if root.is_relative() {
                        prefix.join(root)
                    } else {
                        root
                    }
                })
            })
            .unwrap_or_else(|| prefix.join("releases"));
        let lock_timeout_secs = overrides
            .lock_timeout_secs
            .or(file.lock_timeout_secs)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS);

        Self {
            releases_root,
            lock_timeout: Duration::from_secs(lock_timeout_secs),
            step_retries: file.step_retries.unwrap_or(DEFAULT_STEP_RETRIES),
            trusted_release_key: file
                .trusted_release_key
                .map(|key| key.trim().to_ascii_lowercase()),
        }
    }
}
