//! Outbound report and alarm files.
//!
//! Submitting means writing a uniquely named record into the outbox
//! directories; a separate uploader delivers them at least once. Files
//! that sit undelivered past the age limit are moved to the orphans
//! directory for forensic upload.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::fs::durable;
use crate::fs::quarantine;
use crate::fs::WorkDir;
use crate::models::{EventKey, FaultAlarm, FlowAlarm, GallonsReport, ReportKind};

static FILE_DATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d{4})_(\d{2})_(\d{2})(_|\.)").expect("Invalid regex"));

/// Date encoded in an outbox file name, if any.
fn file_date(name: &str) -> Option<NaiveDate> {
    let caps = FILE_DATE_PATTERN.captures(name)?;
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

pub struct Outbox {
    gals_disp_dir: PathBuf,
    alarms_dir: PathBuf,
    orphans_dir: PathBuf,
}

impl Outbox {
    pub fn new(work_dir: &WorkDir) -> Self {
        Self {
            gals_disp_dir: work_dir.gals_disp_dir(),
            alarms_dir: work_dir.alarms_dir(),
            orphans_dir: work_dir.orphans_dir(),
        }
    }

    /// Write a gallons-dispensed report. Rewriting the same report is safe;
    /// the receiver treats it idempotently.
    pub fn send_report(
        &self,
        key: &EventKey,
        kind: ReportKind,
        report: &GallonsReport,
    ) -> Result<PathBuf> {
        let path = self.gals_disp_dir.join(GallonsReport::file_name(key, kind));
        durable::write(&path, report)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(
            schedule_id = key.schedule_id,
            sequence = key.sequence,
            block = %report.block,
            gallons = report.gallons,
            flow = ?report.flow,
            "gallons dispensed report queued"
        );
        Ok(path)
    }

    /// Write a flow alarm unless one for the same direction, event and day
    /// is already queued.
    pub fn send_flow_alarm(&self, alarm: &FlowAlarm) -> Result<Option<PathBuf>> {
        let path = self.alarms_dir.join(alarm.file_name());
        if path.exists() {
            return Ok(None);
        }
        durable::write(&path, alarm)
            .with_context(|| format!("Failed to write alarm {}", path.display()))?;
        warn!(
            direction = %alarm.direction,
            percent = alarm.percent,
            flow = alarm.flow,
            exp_flow = alarm.exp_flow,
            block = %alarm.block,
            "flow alarm raised"
        );
        Ok(Some(path))
    }

    /// Write a hardware/process fault alarm, once per kind and day.
    pub fn send_fault(&self, fault: &FaultAlarm) -> Result<Option<PathBuf>> {
        let path = self.alarms_dir.join(fault.file_name());
        if path.exists() {
            return Ok(None);
        }
        durable::write(&path, fault)
            .with_context(|| format!("Failed to write alarm {}", path.display()))?;
        tracing::error!(kind = %fault.kind, detail = %fault.detail, "fault alarm raised");
        Ok(Some(path))
    }

    /// Move report and alarm files whose encoded date, plus
    /// `max_age_days`, ended (23:59) before `now` into the orphans
    /// directory.
    pub fn age_out(&self, now: NaiveDateTime, max_age_days: i64) -> Result<Vec<PathBuf>> {
        let mut moved = Vec::new();
        for dir in [&self.gals_disp_dir, &self.alarms_dir] {
            moved.extend(self.age_out_dir(dir, now, max_age_days)?);
        }
        Ok(moved)
    }

    fn age_out_dir(&self, dir: &Path, now: NaiveDateTime, max_age_days: i64) -> Result<Vec<PathBuf>> {
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN);
        let mut moved = Vec::new();

        for path in quarantine::list_files(dir)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let Some(date) = file_date(&name) else {
                continue;
            };

            let limit = date.and_time(end_of_day) + chrono::Duration::days(max_age_days);
            if limit < now {
                if let Some(dest) = quarantine::move_into(&path, &self.orphans_dir)? {
                    warn!(file = %name, "undelivered file aged out");
                    moved.push(dest);
                }
            }
        }

        Ok(moved)
    }
}
