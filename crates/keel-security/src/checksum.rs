use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest of a directory tree: entry kinds, relative paths and file contents,
/// visited in sorted order so the result does not depend on the filesystem.
pub fn sha256_dir_hex(root: &Path) -> Result<String> {
    if !root.is_dir() {
        return Err(anyhow!("not a directory: {}", root.display()));
    }
    let mut hasher = Sha256::new();
    hash_dir(root, "", &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256_dir(root: &Path, expected_hex: &str) -> Result<bool> {
    let actual = sha256_dir_hex(root)?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

fn hash_dir(dir: &Path, rel: &str, hasher: &mut Sha256) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list directory {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| anyhow!("non UTF-8 file name in {}", dir.display()))?;
        let entry_rel = if rel.is_empty() {
            name.to_string()
        } else {
            format!("{rel}/{name}")
        };
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read link {}", path.display()))?;
            hasher.update(format!("link:{entry_rel}\0{}\0", target.display()).as_bytes());
        } else if file_type.is_dir() {
            hasher.update(format!("dir:{entry_rel}\0").as_bytes());
            hash_dir(&path, &entry_rel, hasher)?;
        } else {
            let len = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            hasher.update(format!("file:{entry_rel}\0{len}\0").as_bytes());
            let mut file =
                File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
            hash_reader(&mut file, hasher)
                .with_context(|| format!("failed to read {}", path.display()))?;
        }
    }
    Ok(())
}

fn hash_reader(reader: &mut impl Read, hasher: &mut Sha256) -> io::Result<()> {
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..read]);
    }
}
