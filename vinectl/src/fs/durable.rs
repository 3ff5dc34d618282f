//! Integrity-checked record files.
//!
//! Every record is stored as `{"data": <json>, "sha256": "<hex>"}` where the
//! digest covers the serialized `data`. Writes go to a unique temp file in
//! the target directory, are fsynced, then renamed over the destination.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const BACKUP_SUFFIX: &str = ".old";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    data: Value,
    sha256: String,
}

/// Result of reading one record file.
#[derive(Debug, Clone, PartialEq)]
pub enum Record<T> {
    Absent,
    Corrupt(String),
    Present(T),
}

impl<T> Record<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Record::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Record::Absent)
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Record::Corrupt(_))
    }
}

/// What `read_with_backup` found.
#[derive(Debug)]
pub struct Fallback<T> {
    pub value: Option<T>,
    /// The value came from the `.old` file.
    pub from_backup: bool,
    /// Files that failed the integrity or structure check.
    pub corrupt: Vec<PathBuf>,
}

/// `<path>.old`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn temp_name(file_name: &str) -> String {
    format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4())
}

/// File name a temp file left by [`write`] was going to be installed as.
pub fn temp_target(temp_name: &str) -> Option<&str> {
    let inner = temp_name.strip_prefix('.')?.strip_suffix(".tmp")?;
    inner.rsplit_once('.').map(|(target, _)| target)
}

fn digest(data: &Value) -> Result<String> {
    // serde_json maps are ordered, so equal values serialize identically
    let bytes = serde_json::to_vec(data).context("Failed to serialize record data")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Atomically replace `path` with an integrity-wrapped record.
pub fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_value(value).context("Failed to serialize record")?;
    let envelope = Envelope {
        sha256: digest(&data)?,
        data,
    };
    let bytes = serde_json::to_vec_pretty(&envelope).context("Failed to serialize envelope")?;

    let dir = path
        .parent()
        .with_context(|| format!("Record path has no parent: {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = dir.join(temp_name(&file_name));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to install record: {}", path.display()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Rotate the current file to `.old`, then write the new record.
///
/// A crash between the two steps loses at most the newest write; the backup
/// still holds the previous one.
pub fn write_rotating<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    match fs::rename(path, backup_path(path)) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to rotate backup for {}", path.display()))
        }
    }
    write(path, value)
}

/// Read and verify one record file.
///
/// I/O errors other than not-found are returned as errors; they are
/// transient and the file is left alone.
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<Record<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Record::Absent),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let envelope: Envelope = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(e) => return Ok(Record::Corrupt(format!("not a record envelope: {e}"))),
    };

    if digest(&envelope.data)? != envelope.sha256 {
        return Ok(Record::Corrupt("integrity check failed".to_string()));
    }

    match serde_json::from_value(envelope.data) {
        Ok(value) => Ok(Record::Present(value)),
        Err(e) => Ok(Record::Corrupt(format!("unexpected structure: {e}"))),
    }
}

/// Verify an envelope received over the wire and unwrap its data.
pub fn open_envelope(document: Value) -> Result<Record<Value>> {
    let envelope: Envelope = match serde_json::from_value(document) {
        Ok(envelope) => envelope,
        Err(e) => return Ok(Record::Corrupt(format!("not a record envelope: {e}"))),
    };
    if digest(&envelope.data)? != envelope.sha256 {
        return Ok(Record::Corrupt("integrity check failed".to_string()));
    }
    Ok(Record::Present(envelope.data))
}

/// Read `path`, falling back to `<path>.old` when the current file is
/// missing or corrupt.
pub fn read_with_backup<T: DeserializeOwned>(path: &Path) -> Result<Fallback<T>> {
    let mut corrupt = Vec::new();

    match read(path)? {
        Record::Present(value) => {
            return Ok(Fallback {
                value: Some(value),
                from_backup: false,
                corrupt,
            })
        }
        Record::Corrupt(reason) => {
            tracing::warn!(path = %path.display(), %reason, "record failed verification");
            corrupt.push(path.to_path_buf());
        }
        Record::Absent => {}
    }

    let backup = backup_path(path);
    let value = match read(&backup)? {
        Record::Present(value) => Some(value),
        Record::Corrupt(reason) => {
            tracing::warn!(path = %backup.display(), %reason, "backup failed verification");
            corrupt.push(backup);
            None
        }
        Record::Absent => None,
    };

    Ok(Fallback {
        from_backup: value.is_some(),
        value,
        corrupt,
    })
}

/// Delete a file, treating "already gone" as success.
///
/// Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Delete a record and its backup.
pub fn remove_with_backup(path: &Path) -> Result<()> {
    remove_if_exists(path)?;
    remove_if_exists(&backup_path(path))?;
    Ok(())
}
