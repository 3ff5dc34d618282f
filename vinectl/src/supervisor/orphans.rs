//! Final accounting for checkpoints whose supervisor never finished.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Outcome;
use crate::flow::{self, load_checkpoint};
use crate::fs::durable;
use crate::fs::quarantine;
use crate::fs::WorkDir;
use crate::models::{CheckpointName, GallonsReport, ReportKind};
use crate::outbox::Outbox;
use crate::registry::ProcessRegistry;

/// Stems of events whose supervisor is still alive.
pub fn live_event_stems(registry: &ProcessRegistry) -> HashSet<String> {
    match registry.get() {
        Ok(Some(map)) => map
            .iter()
            .filter(|(pid, _)| registry.is_running(**pid))
            .map(|(_, key)| key.stem())
            .collect(),
        Ok(None) => HashSet::new(),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "could not read registry for orphan sweep");
            HashSet::new()
        }
    }
}

/// Per-event result of a sweep, keyed by event stem.
pub type SweepResult = BTreeMap<String, Outcome<GallonsReport>>;

/// Send final reports for stale checkpoints in the in-progress directory.
///
/// Checkpoints whose stem is in `exclude` belong to a live or resuming
/// event and are left alone. For every other event the newest readable
/// copy is used to compute totals; the final report is queued and the
/// files deleted. Events that cannot be accounted for are moved to the
/// orphans directory, and files that fail verification to the
/// corrupt-files directory. Unrecognised files are moved to orphans.
pub fn recover_orphans(
    config: &Config,
    work_dir: &WorkDir,
    exclude: &HashSet<String>,
) -> Result<SweepResult> {
    let in_progress = work_dir.in_progress_dir();
    let mut stems: BTreeMap<String, CheckpointName> = BTreeMap::new();
    let mut temp_files: Vec<(String, PathBuf)> = Vec::new();

    for path in quarantine::list_files(&in_progress)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if let Some(parsed) = CheckpointName::parse(&name) {
            stems.entry(parsed.stem.clone()).or_insert(parsed);
        } else if let Some(parsed) = durable::temp_target(&name).and_then(CheckpointName::parse) {
            temp_files.push((parsed.stem, path));
        } else {
            warn!(file = %name, "unrecognised file in checkpoint directory");
            quarantine::move_into(&path, &work_dir.orphans_dir())?;
        }
    }

    // a live supervisor may be mid-write on its own temp file
    for (stem, path) in temp_files {
        if !exclude.contains(&stem) {
            durable::remove_if_exists(&path)?;
        }
    }

    let outbox = Outbox::new(work_dir);
    let mut results = SweepResult::new();

    for (stem, name) in stems {
        if exclude.contains(&stem) {
            continue;
        }
        let main = in_progress.join(name.main_file_name());
        let outcome = recover_one(config, work_dir, &outbox, &main);
        match &outcome {
            Outcome::Succeeded(report) => {
                info!(%stem, gallons = report.gallons, flow = ?report.flow, "orphaned event reported")
            }
            Outcome::Failed(reason) => warn!(%stem, %reason, "orphaned event quarantined"),
            Outcome::NotAttempted => {}
        }
        results.insert(stem, outcome);
    }

    Ok(results)
}

fn recover_one(
    config: &Config,
    work_dir: &WorkDir,
    outbox: &Outbox,
    main: &Path,
) -> Outcome<GallonsReport> {
    let result = (|| -> Result<Outcome<GallonsReport>> {
        let fallback = load_checkpoint(config, main)?;
        for bad in &fallback.corrupt {
            quarantine::move_into(bad, &work_dir.corrupt_dir())?;
        }

        let Some(checkpoint) = fallback.value else {
            move_remaining(work_dir, main)?;
            return Ok(Outcome::failed("no readable checkpoint"));
        };

        let flow = match flow::average_flow_rate(&checkpoint.generations, config.gallons_per_pulse) {
            Ok(flow) => flow,
            Err(e) => {
                move_remaining(work_dir, main)?;
                return Ok(Outcome::failed(e));
            }
        };
        let gallons = flow::total_gallons(&checkpoint.generations, config.gallons_per_pulse);

        let key = checkpoint.key();
        let report = GallonsReport::final_totals(&key, &checkpoint.block, gallons, flow);
        outbox.send_report(&key, ReportKind::Final, &report)?;
        durable::remove_with_backup(main)?;

        Ok(Outcome::Succeeded(report))
    })();

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(move_err) = move_remaining(work_dir, main) {
                warn!(error = %format!("{move_err:#}"), "could not quarantine orphan files");
            }
            Outcome::failed(format!("{e:#}"))
        }
    }
}

fn move_remaining(work_dir: &WorkDir, main: &Path) -> Result<()> {
    quarantine::move_into(main, &work_dir.orphans_dir())?;
    quarantine::move_into(&durable::backup_path(main), &work_dir.orphans_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DayKey, EventKey, Generation, PulseCheckpoint, Sample};
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn key(sequence: u32) -> EventKey {
        EventKey {
            date: NaiveDate::from_ymd_opt(2021, 7, 22).unwrap(),
            day: DayKey::Thu,
            sequence,
            schedule_id: 2,
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

    fn write_checkpoint(work_dir: &WorkDir, key: &EventKey, samples: &[(i64, u64)]) -> PathBuf {
        let mut checkpoint = PulseCheckpoint::new(key, "e");
        checkpoint.generations.push(Generation {
            pid: 500,
            samples: samples.iter().map(|&(ts, count)| Sample { ts, count }).collect(),
        });
        let path = work_dir.in_progress_dir().join(key.checkpoint_file_name());
        durable::write_rotating(&path, &checkpoint).unwrap();
        path
    }

    #[test]
    fn test_orphan_reported_and_deleted() {
        let (_temp_dir, config, work_dir) = setup();
        let path = write_checkpoint(&work_dir, &key(1), &[(1000, 1), (1060, 16), (1120, 31)]);

        let results = recover_orphans(&config, &work_dir, &HashSet::new()).unwrap();

        let report = results[&key(1).stem()].clone().succeeded().unwrap();
        assert_eq!(report.gallons, 31);
        assert_eq!(report.flow, Some(15));
        assert!(!path.exists());
        assert!(work_dir
            .gals_disp_dir()
            .join("gals_disp_2021_07_22_2_1_b.json")
            .exists());
    }

    #[test]
    fn test_excluded_stem_untouched() {
        let (_temp_dir, config, work_dir) = setup();
        let path = write_checkpoint(&work_dir, &key(1), &[(1000, 1), (1060, 16)]);
        let exclude = HashSet::from([key(1).stem()]);

        let results = recover_orphans(&config, &work_dir, &exclude).unwrap();

        assert!(results.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_empty_checkpoint_quarantined() {
        let (_temp_dir, config, work_dir) = setup();
        write_checkpoint(&work_dir, &key(2), &[]);

        let results = recover_orphans(&config, &work_dir, &HashSet::new()).unwrap();

        assert!(results[&key(2).stem()].is_failed());
        assert!(work_dir
            .orphans_dir()
            .join(key(2).checkpoint_file_name())
            .exists());
    }

    #[test]
    fn test_backup_only_orphan_recovered() {
        let (_temp_dir, config, work_dir) = setup();
        let path = write_checkpoint(&work_dir, &key(3), &[(1000, 1), (1060, 11)]);
        fs::rename(&path, durable::backup_path(&path)).unwrap();

        let results = recover_orphans(&config, &work_dir, &HashSet::new()).unwrap();

        let report = results[&key(3).stem()].clone().succeeded().unwrap();
        assert_eq!(report.gallons, 11);
        assert!(!durable::backup_path(&path).exists());
    }

    #[test]
    fn test_temp_files_of_live_events_kept() {
        let (_temp_dir, config, work_dir) = setup();
        let in_progress = work_dir.in_progress_dir();
        let live = in_progress.join(format!(".{}.0f3a.tmp", key(1).checkpoint_file_name()));
        let stale = in_progress.join(format!(".{}.9c41.tmp", key(2).checkpoint_file_name()));
        fs::write(&live, "{").unwrap();
        fs::write(&stale, "{").unwrap();
        let exclude = HashSet::from([key(1).stem()]);

        recover_orphans(&config, &work_dir, &exclude).unwrap();

        assert!(live.exists());
        assert!(!stale.exists());
        assert!(!work_dir.orphans_dir().join(live.file_name().unwrap()).exists());
    }

    #[test]
    fn test_unrecognised_files_moved() {
        let (_temp_dir, config, work_dir) = setup();
        fs::write(work_dir.in_progress_dir().join("stray.txt"), "?").unwrap();

        recover_orphans(&config, &work_dir, &HashSet::new()).unwrap();

        assert!(work_dir.orphans_dir().join("stray.txt").exists());
    }
}
