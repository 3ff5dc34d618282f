use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use super::schedule::{DayKey, ScheduledEvent};

/// Identity of one irrigation event on one concrete date.
///
/// For fixed schedules `date` is the day the event runs, not a date taken
/// from the schedule document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    #[serde(rename = "irr_ev_date")]
    pub date: NaiveDate,
    #[serde(rename = "irr_ev_day")]
    pub day: DayKey,
    #[serde(rename = "irr_ev_seq")]
    pub sequence: u32,
    #[serde(rename = "irr_sch_id")]
    pub schedule_id: u32,
}

impl EventKey {
    /// `<yyyy>_<mm>_<dd>_<schedule_id>_<sequence>`, shared by every file
    /// that belongs to this event.
    pub fn stem(&self) -> String {
        event_stem(self.date, self.schedule_id, self.sequence)
    }

    pub fn checkpoint_file_name(&self) -> String {
        format!("pulse_count_{}.json", self.stem())
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schedule {} {} {} seq {}",
            self.schedule_id, self.date, self.day, self.sequence
        )
    }
}

pub fn event_stem(date: NaiveDate, schedule_id: u32, sequence: u32) -> String {
    format!("{}_{schedule_id}_{sequence}", date.format("%Y_%m_%d"))
}

/// A scheduled event resolved against a date: what a supervisor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPlan {
    pub key: EventKey,
    pub event: ScheduledEvent,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl EventPlan {
    pub fn block(&self) -> &str {
        &self.event.block
    }
}

/// A checkpoint file name split into its event stem and backup flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointName {
    pub stem: String,
    pub date: NaiveDate,
    pub schedule_id: u32,
    pub sequence: u32,
    pub is_backup: bool,
}

static CHECKPOINT_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^pulse_count_((\d{4})_(\d{2})_(\d{2})_(\d+)_(\d+))\.json(\.old)?$")
        .expect("Invalid regex")
});

impl CheckpointName {
    /// Parse `pulse_count_<yyyy>_<mm>_<dd>_<schedule_id>_<sequence>.json[.old]`.
    pub fn parse(name: &str) -> Option<Self> {
        let caps = CHECKPOINT_NAME_PATTERN.captures(name)?;
        let date = NaiveDate::from_ymd_opt(
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
            caps[4].parse().ok()?,
        )?;
        Some(Self {
            stem: caps[1].to_string(),
            date,
            schedule_id: caps[5].parse().ok()?,
            sequence: caps[6].parse().ok()?,
            is_backup: caps.get(7).is_some(),
        })
    }

    pub fn main_file_name(&self) -> String {
        format!("pulse_count_{}.json", self.stem)
    }
}
