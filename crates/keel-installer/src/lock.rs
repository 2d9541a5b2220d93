use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use keel_core::InstallError;
use keel_planner::current_unix_timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::InstallLayout;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Diagnostic record written into the lock file by the current holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub pid: u32,
    pub operation: String,
    pub acquired_at_unix: u64,
}

impl LeaseRecord {
    fn describe(&self) -> String {
        format!(
            "pid {} ({}, since unix {})",
            self.pid, self.operation, self.acquired_at_unix
        )
    }
}

/// Exclusive writer guard for one prefix. The advisory lock is released on
/// drop, or by the OS if the holder dies.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
    lease: LeaseRecord,
}

impl InstallLock {
    pub fn acquire(layout: &InstallLayout, operation: &str, timeout: Duration) -> Result<Self> {
        let path = layout.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open install lock: {}", path.display()))?;

        let started = Instant::now();
        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        let holder = read_lease(layout)
                            .ok()
                            .flatten()
                            .map(|lease| lease.describe())
                            .unwrap_or_else(|| "another process".to_string());
                        warn!(
                            path = %path.display(),
                            holder = %holder,
                            waited_ms = waited.as_millis() as u64,
                            "timed out waiting for install lock"
                        );
                        return Err(InstallError::LockTimeout {
                            holder,
                            waited_ms: waited.as_millis() as u64,
                        }
                        .into());
                    }
                    if !announced {
                        info!(path = %path.display(), "waiting for install lock");
                        announced = true;
                    }
                    thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to lock install lock: {}", path.display())
                    });
                }
            }
        }

        let lease = LeaseRecord {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at_unix: current_unix_timestamp()?,
        };
        let encoded = serde_json::to_vec(&lease).context("failed to serialize lease record")?;
        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&encoded))
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to write lease record: {}", path.display()))?;

        info!(
            operation,
            waited_ms = started.elapsed().as_millis() as u64,
            "acquired install lock"
        );
        Ok(Self { file, path, lease })
    }

    pub fn lease(&self) -> &LeaseRecord {
        &self.lease
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.set_len(0) {
            debug!(path = %self.path.display(), error = %err, "failed to clear lease record");
        }
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release install lock");
        } else {
            debug!(operation = %self.lease.operation, "released install lock");
        }
    }
}

/// Reads the lease left by the current (or last) holder. Best effort: the
/// record is diagnostic only and may be empty between holders.
pub fn read_lease(layout: &InstallLayout) -> Result<Option<LeaseRecord>> {
    let path = layout.lock_path();
    let mut raw = String::new();
    match File::open(&path) {
        Ok(mut file) => {
            file.read_to_string(&mut raw)
                .with_context(|| format!("failed to read install lock: {}", path.display()))?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to open install lock: {}", path.display()));
        }
    }

    if raw.trim().is_empty() {
        return Ok(None);
    }
    let lease = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse lease record: {}", path.display()))?;
    Ok(Some(lease))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
