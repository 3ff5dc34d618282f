use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FlowError, Outcome};
use crate::fs::durable::{self, Fallback};
use crate::fs::quarantine;
use crate::fs::WorkDir;
use crate::models::{EventKey, Generation, PulseCheckpoint, Sample};

use super::Pulse;

/// Load a checkpoint, falling back to its `.old` backup.
///
/// A checkpoint whose block is not configured is treated like one that
/// failed its integrity check.
pub fn load_checkpoint(config: &Config, path: &Path) -> Result<Fallback<PulseCheckpoint>> {
    let mut fallback = durable::read_with_backup::<PulseCheckpoint>(path)?;

    if let Some(checkpoint) = &fallback.value {
        if !config.is_known_block(&checkpoint.block) {
            warn!(path = %path.display(), block = %checkpoint.block, "checkpoint names an unknown block");
            let source = if fallback.from_backup {
                durable::backup_path(path)
            } else {
                path.to_path_buf()
            };
            fallback.corrupt.push(source);
            fallback.value = None;
            fallback.from_backup = false;
        }
    }

    Ok(fallback)
}

/// Pulse accumulator for one event, owned by the supervisor loop.
pub struct FlowCounter {
    path: PathBuf,
    checkpoint: PulseCheckpoint,
    gallons_per_pulse: u32,
}

impl FlowCounter {
    /// Start counting for `key` under process `pid`.
    ///
    /// Any checkpoint already on disk for this event is resumed: its
    /// generations are kept and a new one is appended for `pid`. Unreadable
    /// checkpoint files are moved to the corrupt-files directory and
    /// counting starts from nothing; the returned outcome says which
    /// happened.
    pub fn open(
        config: &Config,
        work_dir: &WorkDir,
        key: &EventKey,
        block: &str,
        pid: u32,
    ) -> Result<(Self, Outcome<usize>)> {
        let path = work_dir.in_progress_dir().join(key.checkpoint_file_name());
        let recovered = Self::recover(config, work_dir, &path, key)?;

        let (mut checkpoint, outcome) = match recovered {
            Outcome::Succeeded(checkpoint) => {
                let resumed = checkpoint.generations.len();
                info!(%key, generations = resumed, "resuming pulse count after restart");
                (checkpoint, Outcome::Succeeded(resumed))
            }
            Outcome::Failed(reason) => (PulseCheckpoint::new(key, block), Outcome::Failed(reason)),
            Outcome::NotAttempted => (PulseCheckpoint::new(key, block), Outcome::NotAttempted),
        };
        checkpoint.begin_generation(pid);

        Ok((
            Self {
                path,
                checkpoint,
                gallons_per_pulse: config.gallons_per_pulse,
            },
            outcome,
        ))
    }

    /// Load the newest checkpoint for `key` from `path`.
    ///
    /// `NotAttempted` when nothing is on disk; `Failed` when every copy was
    /// unusable (those files are quarantined).
    pub fn recover(
        config: &Config,
        work_dir: &WorkDir,
        path: &Path,
        key: &EventKey,
    ) -> Result<Outcome<PulseCheckpoint>> {
        let fallback = load_checkpoint(config, path)?;

        for bad in &fallback.corrupt {
            quarantine::move_into(bad, &work_dir.corrupt_dir())?;
        }

        match fallback.value {
            Some(checkpoint) if checkpoint.key() == *key => {
                if fallback.from_backup {
                    warn!(%key, "recovered pulse count from backup");
                }
                Ok(Outcome::Succeeded(checkpoint))
            }
            Some(checkpoint) => {
                let reason = format!("checkpoint belongs to {}", checkpoint.key());
                warn!(%key, %reason, "checkpoint does not match event");
                quarantine::move_into(path, &work_dir.corrupt_dir())?;
                quarantine::move_into(&durable::backup_path(path), &work_dir.corrupt_dir())?;
                Ok(Outcome::Failed(reason))
            }
            None if fallback.corrupt.is_empty() => Ok(Outcome::NotAttempted),
            None => Ok(Outcome::failed("no readable checkpoint")),
        }
    }

    /// Count one pulse in the current generation.
    pub fn record(&mut self, pulse: Pulse) -> Sample {
        let pid = self.pid();
        if self.checkpoint.current_generation().is_none() {
            self.checkpoint.begin_generation(pid);
        }

        match self.checkpoint.current_generation_mut() {
            Some(generation) => {
                let sample = Sample {
                    ts: pulse.ts,
                    count: generation.last_count() + 1,
                };
                generation.samples.push(sample);
                sample
            }
            None => Sample {
                ts: pulse.ts,
                count: 0,
            },
        }
    }

    /// Durably persist the full history, rotating the previous file to
    /// `.old` first.
    pub fn checkpoint(&self) -> Result<()> {
        durable::write_rotating(&self.path, &self.checkpoint)
            .with_context(|| format!("Failed to checkpoint {}", self.path.display()))?;
        debug!(
            path = %self.path.display(),
            samples = self.checkpoint.sample_count(),
            "checkpoint written"
        );
        Ok(())
    }

    pub fn total_gallons(&self) -> u64 {
        super::total_gallons(&self.checkpoint.generations, self.gallons_per_pulse)
    }

    pub fn average_flow_rate(&self) -> Result<u32, FlowError> {
        super::average_flow_rate(&self.checkpoint.generations, self.gallons_per_pulse)
    }

    /// Rate over the trailing window of this process's own samples.
    pub fn current_rate(&self, window_secs: i64) -> Option<u32> {
        self.current_generation()
            .and_then(|g| super::trailing_rate(g, window_secs, self.gallons_per_pulse))
    }

    pub fn current_generation(&self) -> Option<&Generation> {
        self.checkpoint.current_generation()
    }

    pub fn checkpoint_data(&self) -> &PulseCheckpoint {
        &self.checkpoint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pid(&self) -> u32 {
        self.checkpoint
            .current_generation()
            .map(|g| g.pid)
            .unwrap_or_else(crate::process::current_pid)
    }

    /// Remove the checkpoint and its backup after a successful report.
    pub fn delete_files(&self) -> Result<()> {
        durable::remove_with_backup(&self.path)
    }

    /// Move the checkpoint and its backup to `dest_dir` for later upload.
    pub fn quarantine_files(&self, dest_dir: &Path) -> Result<()> {
        quarantine::move_into(&self.path, dest_dir)?;
        quarantine::move_into(&durable::backup_path(&self.path), dest_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DayKey;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn key() -> EventKey {
        EventKey {
            date: NaiveDate::from_ymd_opt(2021, 7, 22).unwrap(),
            day: DayKey::Thu,
            sequence: 1,
            schedule_id: 4,
        }
    }

    fn setup() -> (TempDir, Config, WorkDir) {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = WorkDir::new(temp_dir.path());
        work_dir.ensure().unwrap();
        let config = Config {
            root: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        (temp_dir, config, work_dir)
    }

    fn feed(counter: &mut FlowCounter, start: i64, count: i64) {
        for i in 0..count {
            counter.record(Pulse { ts: start + i * 4 });
        }
    }

    #[test]
    fn test_fresh_counter_not_attempted() {
        let (_temp_dir, config, work_dir) = setup();
        let (counter, outcome) = FlowCounter::open(&config, &work_dir, &key(), "c", 100).unwrap();

        assert_eq!(outcome, Outcome::NotAttempted);
        assert_eq!(counter.checkpoint_data().generations.len(), 1);
        assert_eq!(counter.total_gallons(), 0);
        assert_eq!(counter.average_flow_rate(), Err(FlowError::NoData));
    }

    #[test]
    fn test_record_accumulates() {
        let (_temp_dir, config, work_dir) = setup();
        let (mut counter, _) = FlowCounter::open(&config, &work_dir, &key(), "c", 100).unwrap();

        let first = counter.record(Pulse { ts: 10 });
        let second = counter.record(Pulse { ts: 14 });

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(counter.total_gallons(), 2);
    }

    #[test]
    fn test_crash_recovery_preserves_totals() {
        let (_temp_dir, config, work_dir) = setup();

        let (mut before, _) = FlowCounter::open(&config, &work_dir, &key(), "c", 100).unwrap();
        feed(&mut before, 1_000, 12);
        before.checkpoint().unwrap();
        let gallons_before = before.total_gallons();
        let rate_before = before.average_flow_rate().unwrap();
        drop(before);

        // new process after reboot
        let (mut after, outcome) = FlowCounter::open(&config, &work_dir, &key(), "c", 200).unwrap();
        assert_eq!(outcome, Outcome::Succeeded(1));
        assert_eq!(after.total_gallons(), gallons_before);
        assert_eq!(after.average_flow_rate().unwrap(), rate_before);

        feed(&mut after, 5_000, 5);
        assert_eq!(after.total_gallons(), 17);
        assert_eq!(after.checkpoint_data().generations[1].pid, 200);
    }

    #[test]
    fn test_recover_falls_back_to_backup() {
        let (_temp_dir, config, work_dir) = setup();
        let (mut counter, _) = FlowCounter::open(&config, &work_dir, &key(), "c", 100).unwrap();

        feed(&mut counter, 1_000, 3);
        counter.checkpoint().unwrap();
        feed(&mut counter, 2_000, 3);
        counter.checkpoint().unwrap();
        fs::write(counter.path(), "{").unwrap();

        let recovered = FlowCounter::recover(&config, &work_dir, counter.path(), &key()).unwrap();
        let checkpoint = recovered.succeeded().unwrap();
        assert_eq!(checkpoint.generations[0].max_count(), 3);
        assert!(work_dir
            .corrupt_dir()
            .join(key().checkpoint_file_name())
            .exists());
    }

    #[test]
    fn test_recover_unusable_files_fail() {
        let (_temp_dir, config, work_dir) = setup();
        let path = work_dir.in_progress_dir().join(key().checkpoint_file_name());
        fs::write(&path, "garbage").unwrap();
        fs::write(durable::backup_path(&path), "garbage").unwrap();

        let recovered = FlowCounter::recover(&config, &work_dir, &path, &key()).unwrap();
        assert!(recovered.is_failed());
        assert!(!path.exists());
        assert!(!durable::backup_path(&path).exists());
    }

    #[test]
    fn test_unknown_block_is_rejected() {
        let (_temp_dir, config, work_dir) = setup();
        let (mut counter, _) = FlowCounter::open(&config, &work_dir, &key(), "z", 100).unwrap();
        feed(&mut counter, 1_000, 2);
        counter.checkpoint().unwrap();

        let recovered = FlowCounter::recover(&config, &work_dir, counter.path(), &key()).unwrap();
        assert!(recovered.is_failed());
    }

    #[test]
    fn test_delete_files_removes_backup() {
        let (_temp_dir, config, work_dir) = setup();
        let (mut counter, _) = FlowCounter::open(&config, &work_dir, &key(), "c", 100).unwrap();
        feed(&mut counter, 1_000, 2);
        counter.checkpoint().unwrap();
        counter.checkpoint().unwrap();

        counter.delete_files().unwrap();
        assert!(!counter.path().exists());
        assert!(!durable::backup_path(counter.path()).exists());
    }
}
