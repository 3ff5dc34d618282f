//! The "give up and go safe" path.

use anyhow::Result;
use chrono::NaiveDate;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::error::Outcome;
use crate::fs::durable;
use crate::fs::quarantine;
use crate::fs::WorkDir;
use crate::models::Schedule;
use crate::registry::ProcessRegistry;

use super::store::ScheduleStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub killed: Vec<u32>,
    /// Pulse checkpoints moved to the orphans directory
    pub preserved: Vec<PathBuf>,
    pub schedule: Option<PathBuf>,
}

/// File name the default schedule is installed under by a reset on `today`.
pub fn default_schedule_file_name(today: NaiveDate) -> String {
    format!("{}_fixed_0.json", today.format("%Y_%m_%d"))
}

/// Stop every supervisor, clear schedule and event state, and install the
/// default no-irrigation schedule.
///
/// Every step is attempted even when an earlier one fails; the outcome is
/// `Failed` if any step did. Pulse checkpoints are moved to the orphans
/// directory rather than deleted. Valves are not touched here.
pub fn software_reset(work_dir: &WorkDir, today: NaiveDate) -> Outcome<ResetReport> {
    warn!("software reset");
    let mut report = ResetReport::default();
    let mut failures: Vec<String> = Vec::new();
    let mut step = |name: &str, result: Result<()>| {
        if let Err(e) = result {
            error!(step = name, error = %format!("{e:#}"), "reset step failed");
            failures.push(format!("{name}: {e:#}"));
        }
    };

    if let Err(e) = work_dir.ensure() {
        step("ensure directories", Err(e));
    }

    let registry = ProcessRegistry::new(work_dir);
    match registry.clear_all() {
        Outcome::Succeeded(killed) => report.killed = killed,
        Outcome::NotAttempted => {}
        Outcome::Failed(reason) => step("clear registry", Err(anyhow::anyhow!(reason))),
    }

    let store = ScheduleStore::new(work_dir);
    step("clear schedules", store.clear().map(|_| ()));
    step(
        "clear event directory",
        quarantine::clear_dir(&work_dir.irr_event_dir()).map(|_| ()),
    );

    let in_progress = (|| -> Result<Vec<PathBuf>> {
        let mut preserved = Vec::new();
        for path in quarantine::list_files(&work_dir.in_progress_dir())? {
            let is_checkpoint = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("pulse_count_"));
            if is_checkpoint {
                if let Some(dest) = quarantine::move_into(&path, &work_dir.orphans_dir())? {
                    preserved.push(dest);
                }
            } else {
                durable::remove_if_exists(&path)?;
            }
        }
        Ok(preserved)
    })();
    match in_progress {
        Ok(preserved) => report.preserved = preserved,
        Err(e) => step("preserve checkpoints", Err(e)),
    }

    match store.write_current(
        &Schedule::default_schedule(),
        &default_schedule_file_name(today),
    ) {
        Ok(path) => report.schedule = Some(path),
        Err(e) => step("install default schedule", Err(e)),
    }

    if failures.is_empty() {
        info!(
            killed = report.killed.len(),
            preserved = report.preserved.len(),
            "software reset complete"
        );
        Outcome::Succeeded(report)
    } else {
        Outcome::failed(failures.join("; "))
    }
}
