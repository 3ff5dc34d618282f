//! The in-force and staged schedule directories.
//!
//! Each directory is meant to hold a single schedule file named
//! `<yyyy>_<mm>_<dd>_<fixed|intel>_<id>.json`. Installing clears the
//! current directory and moves the staged file in; nothing is ever merged.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ScheduleError;
use crate::fs::durable::{self, Record};
use crate::fs::quarantine;
use crate::fs::WorkDir;
use crate::models::{Schedule, ScheduleDescriptor, ScheduleFileName, ScheduleKind};

use super::validation;

/// What `tidy` did to a schedule directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TidyReport {
    pub quarantined: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub kept: Option<PathBuf>,
}

pub struct ScheduleStore {
    current_dir: PathBuf,
    new_dir: PathBuf,
    corrupt_dir: PathBuf,
}

impl ScheduleStore {
    pub fn new(work_dir: &WorkDir) -> Self {
        Self {
            current_dir: work_dir.schedule_current_dir(),
            new_dir: work_dir.schedule_new_dir(),
            corrupt_dir: work_dir.corrupt_dir(),
        }
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    /// The in-force schedule.
    ///
    /// More than one file in the directory is reported as corrupt; run
    /// [`ScheduleStore::tidy_current`] first to resolve it.
    pub fn current(&self) -> Result<Record<Schedule>> {
        single_record(&self.current_dir)
    }

    pub fn staged(&self) -> Result<Record<Schedule>> {
        single_record(&self.new_dir)
    }

    pub fn current_descriptor(&self) -> Result<Option<ScheduleDescriptor>> {
        Ok(self.current()?.present().map(|s| s.descriptor()))
    }

    pub fn tidy_current(&self) -> Result<TidyReport> {
        self.tidy(&self.current_dir)
    }

    pub fn tidy_staged(&self) -> Result<TidyReport> {
        self.tidy(&self.new_dir)
    }

    /// Reduce `dir` to at most one schedule file.
    ///
    /// Files failing verification are quarantined and badly named files
    /// deleted. A fixed schedule wins over intelligent ones; among
    /// intelligent schedules the highest id wins. Two or more fixed
    /// schedules cannot be resolved and yield
    /// [`ScheduleError::ConflictingFixed`] with the directory untouched
    /// beyond the quarantine step.
    fn tidy(&self, dir: &Path) -> Result<TidyReport> {
        let mut report = TidyReport::default();
        let mut fixed: Vec<PathBuf> = Vec::new();
        let mut intel: Vec<(u32, PathBuf)> = Vec::new();

        for path in quarantine::list_files(dir)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let Some(parsed) = ScheduleFileName::parse(&name) else {
                warn!(file = %name, "not a schedule file name, deleting");
                durable::remove_if_exists(&path)?;
                report.deleted.push(path);
                continue;
            };

            match durable::read::<Schedule>(&path)? {
                Record::Present(schedule) if schedule.kind() == parsed.kind => {}
                Record::Present(_) => {
                    warn!(file = %name, "schedule kind does not match file name");
                    self.quarantine(&path, &mut report)?;
                    continue;
                }
                Record::Corrupt(reason) => {
                    warn!(file = %name, %reason, "schedule failed verification");
                    self.quarantine(&path, &mut report)?;
                    continue;
                }
                Record::Absent => continue,
            }

            match parsed.kind {
                ScheduleKind::Fixed => fixed.push(path),
                ScheduleKind::Intelligent => intel.push((parsed.id, path)),
            }
        }

        if fixed.len() > 1 {
            return Err(ScheduleError::ConflictingFixed { fixed: fixed.len() }.into());
        }

        let keep = match fixed.pop() {
            Some(path) => Some(path),
            None => intel.iter().max_by_key(|(id, _)| *id).map(|(_, path)| path.clone()),
        };

        for (_, path) in intel {
            if Some(&path) != keep.as_ref() {
                durable::remove_if_exists(&path)?;
                report.deleted.push(path);
            }
        }
        if !report.deleted.is_empty() || !report.quarantined.is_empty() {
            info!(
                dir = %dir.display(),
                deleted = report.deleted.len(),
                quarantined = report.quarantined.len(),
                "schedule directory tidied"
            );
        }

        report.kept = keep;
        Ok(report)
    }

    fn quarantine(&self, path: &Path, report: &mut TidyReport) -> Result<()> {
        if let Some(dest) = quarantine::move_into(path, &self.corrupt_dir)? {
            report.quarantined.push(dest);
        }
        Ok(())
    }

    /// True unless `candidate` has the same (type, created_ts, created_date,
    /// id) as the schedule in force.
    pub fn differs_from_current(&self, candidate: &Schedule) -> Result<bool> {
        Ok(self.current_descriptor()? != Some(candidate.descriptor()))
    }

    /// Replace whatever is staged with `schedule`.
    pub fn stage(&self, schedule: &Schedule) -> Result<PathBuf> {
        quarantine::clear_dir(&self.new_dir)?;
        let path = self.new_dir.join(schedule.file_name());
        durable::write(&path, schedule)
            .with_context(|| format!("Failed to stage schedule {}", path.display()))?;
        Ok(path)
    }

    /// Move the single staged file into the current directory, clearing
    /// the current directory first.
    pub fn install_staged(&self) -> Result<PathBuf> {
        let staged = quarantine::list_files(&self.new_dir)?;
        let source = match staged.as_slice() {
            [only] => only,
            [] => bail!("No staged schedule to install"),
            _ => bail!("{} files in {}", staged.len(), self.new_dir.display()),
        };
        let name = source
            .file_name()
            .with_context(|| format!("Not a file path: {}", source.display()))?;

        fs::create_dir_all(&self.current_dir)
            .with_context(|| format!("Failed to create {}", self.current_dir.display()))?;
        quarantine::clear_dir(&self.current_dir)?;

        let dest = self.current_dir.join(name);
        fs::rename(source, &dest).with_context(|| {
            format!("Failed to move {} into {}", source.display(), dest.display())
        })?;

        info!(file = %dest.display(), "schedule put in force");
        Ok(dest)
    }

    /// Validate, diff-check, stage and install a candidate schedule.
    ///
    /// An identical schedule is rejected with [`ScheduleError::Identical`];
    /// callers treat that as "nothing to do".
    pub fn install(&self, schedule: &Schedule, config: &Config) -> Result<PathBuf> {
        validation::validate(schedule, config)?;
        if !self.differs_from_current(schedule)? {
            return Err(ScheduleError::Identical.into());
        }
        self.stage(schedule)?;
        self.install_staged()
    }

    /// Put `schedule` in force under `file_name` without staging. Used by
    /// the reset path, which has already cleared everything.
    pub fn write_current(&self, schedule: &Schedule, file_name: &str) -> Result<PathBuf> {
        quarantine::clear_dir(&self.current_dir)?;
        let path = self.current_dir.join(file_name);
        durable::write(&path, schedule)
            .with_context(|| format!("Failed to write schedule {}", path.display()))?;
        Ok(path)
    }

    pub fn clear(&self) -> Result<usize> {
        Ok(quarantine::clear_dir(&self.current_dir)? + quarantine::clear_dir(&self.new_dir)?)
    }
}

fn single_record(dir: &Path) -> Result<Record<Schedule>> {
    let files = quarantine::list_files(dir)?;
    match files.as_slice() {
        [] => Ok(Record::Absent),
        [only] => durable::read(only),
        _ => Ok(Record::Corrupt(format!(
            "{} files in {}",
            files.len(),
            dir.display()
        ))),
    }
}
