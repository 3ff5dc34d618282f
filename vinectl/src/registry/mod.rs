//! Shared record of which process supervises which irrigation event.
//!
//! Independently launched controller invocations find each other through
//! this file. Every read-modify-write holds an exclusive `flock` on
//! `registry.lock`; plain reads hold a shared one. Concurrent writers are
//! serialized, and each sees the result of the writer before it.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{Outcome, RegistryError};
use crate::fs::durable::{self, Record};
use crate::fs::quarantine;
use crate::fs::WorkDir;
use crate::models::EventKey;
use crate::process::{current_pid, is_process_alive, terminate};

/// pid -> event being supervised
pub type RegistryMap = BTreeMap<u32, EventKey>;

pub struct ProcessRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    corrupt_dir: PathBuf,
}

/// Held advisory lock; released on drop when the file closes.
struct RegistryLock {
    _file: File,
}

impl ProcessRegistry {
    pub fn new(work_dir: &WorkDir) -> Self {
        Self {
            path: work_dir.registry_path(),
            lock_path: work_dir.registry_lock_path(),
            corrupt_dir: work_dir.corrupt_dir(),
        }
    }

    fn lock(&self, exclusive: bool) -> Result<RegistryLock> {
        if let Some(dir) = self.lock_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open {}", self.lock_path.display()))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.with_context(|| format!("Failed to lock {}", self.lock_path.display()))?;

        Ok(RegistryLock { _file: file })
    }

    fn read_locked(&self) -> Result<Option<RegistryMap>> {
        match durable::read::<RegistryMap>(&self.path)? {
            Record::Absent => Ok(None),
            Record::Present(map) if map.is_empty() => Ok(None),
            Record::Present(map) => Ok(Some(map)),
            Record::Corrupt(reason) => Err(RegistryError::Corrupt { reason }.into()),
        }
    }

    fn write_locked(&self, map: &RegistryMap) -> Result<()> {
        if map.is_empty() {
            durable::remove_if_exists(&self.path)?;
            return Ok(());
        }
        durable::write(&self.path, map).context("Failed to write process registry")
    }

    /// Current registry contents. An absent registry means nothing is
    /// running and is not an error.
    pub fn get(&self) -> Result<Option<RegistryMap>> {
        let _lock = self.lock(false)?;
        self.read_locked()
    }

    /// Replace the whole registry. An empty map deletes it.
    pub fn put(&self, map: &RegistryMap) -> Result<()> {
        let _lock = self.lock(true)?;
        self.write_locked(map)
    }

    /// Delete the registry record. Returns whether one existed.
    pub fn delete(&self) -> Result<bool> {
        let _lock = self.lock(true)?;
        durable::remove_if_exists(&self.path)
    }

    /// Register `pid` as supervising `key`.
    ///
    /// Fails with [`RegistryError::AlreadyRegistered`] if `pid` already has
    /// an entry.
    pub fn add(&self, pid: u32, key: EventKey) -> Result<()> {
        let _lock = self.lock(true)?;
        let mut map = self.read_locked()?.unwrap_or_default();

        if map.contains_key(&pid) {
            return Err(RegistryError::AlreadyRegistered { pid }.into());
        }
        if !map.is_empty() {
            warn!(pid, others = ?map.keys().collect::<Vec<_>>(), "registering alongside live entries");
        }

        map.insert(pid, key);
        self.write_locked(&map)?;
        info!(pid, "registered event supervisor");
        Ok(())
    }

    /// Drop the entry for `pid`. Removing the last entry deletes the record.
    pub fn remove(&self, pid: u32) -> Result<bool> {
        let _lock = self.lock(true)?;
        let Some(mut map) = self.read_locked()? else {
            return Ok(false);
        };

        let removed = map.remove(&pid).is_some();
        if removed {
            self.write_locked(&map)?;
            debug!(pid, "removed registry entry");
        }
        Ok(removed)
    }

    pub fn contains(&self, pid: u32) -> Result<bool> {
        Ok(self.get()?.is_some_and(|map| map.contains_key(&pid)))
    }

    pub fn is_running(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    /// Drop entries whose process no longer exists.
    ///
    /// Returns the pids removed, or `NotAttempted` when there is no registry.
    pub fn refresh(&self) -> Outcome<Vec<u32>> {
        let result = (|| -> Result<Option<Vec<u32>>> {
            let _lock = self.lock(true)?;
            let Some(mut map) = self.read_locked()? else {
                return Ok(None);
            };

            let dead: Vec<u32> = map
                .keys()
                .copied()
                .filter(|pid| !is_process_alive(*pid))
                .collect();

            if !dead.is_empty() {
                for pid in &dead {
                    map.remove(pid);
                }
                self.write_locked(&map)?;
                info!(removed = ?dead, "dropped registry entries of exited processes");
            }
            Ok(Some(dead))
        })();

        match result {
            Ok(None) => Outcome::NotAttempted,
            Ok(Some(dead)) => Outcome::Succeeded(dead),
            Err(e) => Outcome::failed(format!("{e:#}")),
        }
    }

    /// Terminate `pid` and drop its entry.
    pub fn kill_and_remove(&self, pid: u32) -> Result<()> {
        let _lock = self.lock(true)?;

        terminate(pid).map_err(|e| RegistryError::KillFailed {
            pid,
            reason: format!("{e:#}"),
        })?;
        warn!(pid, "terminated event supervisor");

        if let Some(mut map) = self.read_locked()? {
            if map.remove(&pid).is_some() {
                self.write_locked(&map)?;
            }
        }
        Ok(())
    }

    /// Terminate every listed process, then delete the registry.
    ///
    /// An absent registry is `NotAttempted`. A corrupt one is moved to the
    /// corrupt-files directory, since its pids cannot be trusted. Entries
    /// whose process could not be killed stay in the record and the result
    /// is `Failed`.
    pub fn clear_all(&self) -> Outcome<Vec<u32>> {
        let result = (|| -> Result<Option<(Vec<u32>, Vec<String>)>> {
            let _lock = self.lock(true)?;

            let map = match self.read_locked() {
                Ok(Some(map)) => map,
                Ok(None) => {
                    durable::remove_if_exists(&self.path)?;
                    return Ok(None);
                }
                Err(e) if e.downcast_ref::<RegistryError>().is_some() => {
                    warn!(error = %e, "quarantining unreadable registry");
                    quarantine::move_into(&self.path, &self.corrupt_dir)?;
                    return Ok(Some((Vec::new(), Vec::new())));
                }
                Err(e) => return Err(e),
            };

            let own_pid = current_pid();
            let mut killed = Vec::new();
            let mut failures = Vec::new();
            let mut survivors = RegistryMap::new();

            for (pid, key) in map {
                if pid == own_pid {
                    continue;
                }
                if !is_process_alive(pid) {
                    continue;
                }
                match terminate(pid) {
                    Ok(()) => killed.push(pid),
                    Err(e) => {
                        failures.push(format!("{pid}: {e:#}"));
                        survivors.insert(pid, key);
                    }
                }
            }

            self.write_locked(&survivors)?;
            Ok(Some((killed, failures)))
        })();

        match result {
            Ok(None) => Outcome::NotAttempted,
            Ok(Some((killed, failures))) if failures.is_empty() => {
                if !killed.is_empty() {
                    warn!(?killed, "terminated registered processes");
                }
                Outcome::Succeeded(killed)
            }
            Ok(Some((_, failures))) => Outcome::failed(format!(
                "could not terminate: {}",
                failures.join(", ")
            )),
            Err(e) => Outcome::failed(format!("{e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DayKey;
    use chrono::NaiveDate;
    use std::process::Command;
    use tempfile::TempDir;

    fn key(sequence: u32) -> EventKey {
        EventKey {
            date: NaiveDate::from_ymd_opt(2021, 7, 22).unwrap(),
            day: DayKey::Thu,
            sequence,
            schedule_id: 3,
        }
    }

    fn setup() -> (TempDir, ProcessRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = WorkDir::new(temp_dir.path());
        work_dir.ensure().unwrap();
        let registry = ProcessRegistry::new(&work_dir);
        (temp_dir, registry)
    }

    #[test]
    fn test_absent_registry_is_none() {
        let (_temp_dir, registry) = setup();
        assert!(registry.get().unwrap().is_none());
        assert!(!registry.contains(42).unwrap());
    }

    #[test]
    fn test_add_then_get() {
        let (_temp_dir, registry) = setup();
        registry.add(42, key(1)).unwrap();

        let map = registry.get().unwrap().unwrap();
        assert_eq!(map.get(&42), Some(&key(1)));
        assert!(registry.contains(42).unwrap());
    }

    #[test]
    fn test_add_duplicate_pid_fails() {
        let (_temp_dir, registry) = setup();
        registry.add(42, key(1)).unwrap();

        let err = registry.add(42, key(2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::AlreadyRegistered { pid: 42 })
        ));
        // first entry untouched
        assert_eq!(registry.get().unwrap().unwrap()[&42], key(1));
    }

    #[test]
    fn test_removing_last_entry_deletes_file() {
        let (temp_dir, registry) = setup();
        let path = WorkDir::new(temp_dir.path()).registry_path();

        registry.add(42, key(1)).unwrap();
        registry.add(43, key(2)).unwrap();
        assert!(registry.remove(42).unwrap());
        assert!(path.exists());
        assert!(registry.remove(43).unwrap());
        assert!(!path.exists());
        assert!(!registry.remove(43).unwrap());
    }

    #[test]
    fn test_refresh_drops_dead_processes() {
        let (_temp_dir, registry) = setup();
        registry.add(current_pid(), key(1)).unwrap();
        registry.add(99_999_999, key(2)).unwrap();

        let outcome = registry.refresh();
        assert_eq!(outcome, Outcome::Succeeded(vec![99_999_999]));

        let map = registry.get().unwrap().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&current_pid()));
    }

    #[test]
    fn test_refresh_without_registry_not_attempted() {
        let (_temp_dir, registry) = setup();
        assert_eq!(registry.refresh(), Outcome::NotAttempted);
    }

    #[test]
    fn test_clear_all_absent_is_not_a_failure() {
        let (_temp_dir, registry) = setup();
        let outcome = registry.clear_all();
        assert_eq!(outcome, Outcome::NotAttempted);
        assert!(outcome.is_ok_or_skipped());
    }

    #[test]
    fn test_clear_all_kills_and_deletes() {
        let (_temp_dir, registry) = setup();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        registry.add(pid, key(1)).unwrap();
        registry.add(99_999_999, key(2)).unwrap();

        let outcome = registry.clear_all();
        child.wait().unwrap();

        assert_eq!(outcome, Outcome::Succeeded(vec![pid]));
        assert!(registry.get().unwrap().is_none());
    }

    #[test]
    fn test_clear_all_never_kills_own_process() {
        let (_temp_dir, registry) = setup();
        registry.add(current_pid(), key(1)).unwrap();

        assert_eq!(registry.clear_all(), Outcome::Succeeded(vec![]));
        assert!(registry.get().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_registry_is_quarantined_by_clear_all() {
        let (temp_dir, registry) = setup();
        let work_dir = WorkDir::new(temp_dir.path());
        fs::write(work_dir.registry_path(), "{\"data\":").unwrap();

        let err = registry.get().unwrap_err();
        assert!(err.downcast_ref::<RegistryError>().is_some());

        assert!(registry.clear_all().is_succeeded());
        assert!(!work_dir.registry_path().exists());
        assert!(work_dir.corrupt_dir().join("process_reg.json").exists());
    }

    #[test]
    fn test_kill_and_remove() {
        let (_temp_dir, registry) = setup();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        registry.add(pid, key(1)).unwrap();

        registry.kill_and_remove(pid).unwrap();
        let status = child.wait().unwrap();

        assert!(!status.success());
        assert!(registry.get().unwrap().is_none());
    }
}
