//! Moving files out of the working tree without losing them.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Move `source` into `dest_dir`, keeping its file name.
///
/// If a file of that name is already there the moved copy gets a timestamp
/// suffix, so nothing in `dest_dir` is overwritten. Returns `Ok(None)` if the
/// source no longer exists.
pub fn move_into(source: &Path, dest_dir: &Path) -> Result<Option<PathBuf>> {
    if !source.exists() {
        return Ok(None);
    }

    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let file_name = source
        .file_name()
        .with_context(|| format!("Not a file path: {}", source.display()))?
        .to_string_lossy()
        .to_string();

    let mut dest = dest_dir.join(&file_name);
    if dest.exists() {
        let stamp = Local::now().format("%Y%m%d%H%M%S%f");
        dest = dest_dir.join(format!("{file_name}.{stamp}"));
    }

    if fs::rename(source, &dest).is_err() {
        // rename fails across filesystems
        fs::copy(source, &dest)
            .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;
        fs::remove_file(source)
            .with_context(|| format!("Failed to remove {}", source.display()))?;
    }

    Ok(Some(dest))
}

/// Delete every regular file directly inside `dir`. A missing directory is
/// already clear.
pub fn clear_dir(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }

    Ok(removed)
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}
