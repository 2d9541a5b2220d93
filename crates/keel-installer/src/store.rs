use std::fs;
use std::io;

use anyhow::{Context, Result};
use keel_core::{find_install_error, InstallError, InstallationState};
use keel_security::sha256_hex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::InstallLayout;

const SEALED_RECORD_VERSION: u32 = 1;

#[derive(Serialize)]
struct SealedRecordOut<'a, T> {
    version: u32,
    sha256: String,
    payload: &'a T,
}

#[derive(Deserialize)]
struct SealedRecordIn<T> {
    version: u32,
    sha256: String,
    payload: T,
}

/// Wraps `value` in an envelope carrying the SHA-256 of its canonical JSON.
pub(crate) fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let canonical = serde_json::to_vec(value).context("failed to serialize record")?;
    let record = SealedRecordOut {
        version: SEALED_RECORD_VERSION,
        sha256: sha256_hex(&canonical),
        payload: value,
    };
    let mut bytes = serde_json::to_vec_pretty(&record).context("failed to serialize record")?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Inverse of [`seal`]; the error string explains why the record is not trustworthy.
pub(crate) fn unseal<T: Serialize + DeserializeOwned>(raw: &[u8]) -> Result<T, String> {
    let record: SealedRecordIn<T> =
        serde_json::from_slice(raw).map_err(|err| format!("record is not readable: {err}"))?;
    if record.version != SEALED_RECORD_VERSION {
        return Err(format!(
            "unsupported record version {} (expected {SEALED_RECORD_VERSION})",
            record.version
        ));
    }
    let canonical = serde_json::to_vec(&record.payload)
        .map_err(|err| format!("record payload cannot be re-serialized: {err}"))?;
    let actual = sha256_hex(&canonical);
    if actual != record.sha256 {
        return Err(format!(
            "checksum mismatch (recorded {}, computed {actual})",
            record.sha256
        ));
    }
    Ok(record.payload)
}

/// Owner of the single durable [`InstallationState`] record.
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: InstallLayout,
}

impl StateStore {
    /// Opens the store, discarding any temporary record left by an interrupted save.
    pub fn open(layout: &InstallLayout) -> Result<Self> {
        let state_dir = layout.state_dir();
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;

        let tmp = layout.state_tmp_path();
        if tmp.exists() {
            warn!(
                path = %tmp.display(),
                "discarding temporary state record from an interrupted write"
            );
            remove_file_if_exists(&tmp)
                .with_context(|| format!("failed to remove stale {}", tmp.display()))?;
        }

        Ok(Self {
            layout: layout.clone(),
        })
    }

    /// Opens the store for reading only. Nothing on disk is touched, so this
    /// is safe while another process holds the install lock.
    pub fn reader(layout: &InstallLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn load(&self) -> Result<InstallationState> {
        let path = self.layout.state_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(InstallError::NotFound.into());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read installation state: {}", path.display())
                });
            }
        };

        let state = unseal::<InstallationState>(&raw)
            .map_err(|reason| InstallError::Corruption { reason })?;
        debug!(
            version = %state.current_version(),
            status = %state.status(),
            "loaded installation state"
        );
        Ok(state)
    }

    /// Like [`StateStore::load`] but treats a missing record as `None`.
    /// Corruption is still an error.
    pub fn load_optional(&self) -> Result<Option<InstallationState>> {
        match self.load() {
            Ok(state) => Ok(Some(state)),
            Err(err) if matches!(find_install_error(&err), Some(InstallError::NotFound)) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, state: &InstallationState) -> Result<()> {
        let path = self.layout.state_path();
        let bytes = seal(state)?;
        write_atomic(&path, &bytes)
            .with_context(|| format!("failed to save installation state: {}", path.display()))?;
        debug!(
            version = %state.current_version(),
            status = %state.status(),
            "saved installation state"
        );
        Ok(())
    }
}
