use anyhow::{Context, Result};
use keel_core::VersionDescriptor;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    prefix: PathBuf,
}

impl InstallLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn config_path(&self) -> PathBuf {
        self.prefix.join("keel.toml")
    }

    pub fn components_dir(&self) -> PathBuf {
        self.prefix.join("components")
    }

    pub fn component_dir(&self, name: &str) -> PathBuf {
        self.components_dir().join(name)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.prefix.join("backups")
    }

    pub fn backup_dir(&self, version: &VersionDescriptor) -> PathBuf {
        self.backups_dir().join(version.to_string())
    }

    pub fn backup_components_dir(&self, version: &VersionDescriptor) -> PathBuf {
        self.backup_dir(version).join("components")
    }

    pub fn backup_snapshot_path(&self, version: &VersionDescriptor) -> PathBuf {
        self.backup_dir(version).join("snapshot.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.prefix.join("state")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("installation.json")
    }

    pub fn state_tmp_path(&self) -> PathBuf {
        self.state_dir().join("installation.json.tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("keel.lock")
    }

    pub fn active_version_path(&self) -> PathBuf {
        self.state_dir().join("active")
    }

    pub fn migrations_state_dir(&self) -> PathBuf {
        self.state_dir().join("migrations")
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }

    pub fn checkpoint_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir()
            .join(format!("{txid}.checkpoint.json"))
    }

    pub fn journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.components_dir(),
            self.backups_dir(),
            self.state_dir(),
            self.migrations_state_dir(),
            self.transactions_dir(),
            self.transactions_staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_user_prefix() -> Result<PathBuf> {
    if let Some(prefix) = std::env::var_os("KEEL_PREFIX").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(prefix));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user prefix")?;
        return Ok(PathBuf::from(app_data).join("Keel"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user prefix")?;
    Ok(PathBuf::from(home).join(".keel"))
}
