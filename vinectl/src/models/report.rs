use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::event::EventKey;

pub const REPORT_WHATAMI: &str = "gallons-dispensed";
pub const FLOW_ALARM_WHATAMI: &str = "flow-alarm";
pub const FAULT_ALARM_WHATAMI: &str = "fault-alarm";

/// Which of the two per-event reports a file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Sent at event start: 1 gallon, no flow
    Initial,
    /// Sent at event end with totals
    Final,
}

impl ReportKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            ReportKind::Initial => "a",
            ReportKind::Final => "b",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GallonsReport {
    pub whatami: String,
    pub date: NaiveDate,
    pub sched_id: u32,
    pub sequence: u32,
    pub block: String,
    pub gallons: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<u32>,
}

impl GallonsReport {
    /// The start-of-event marker that keeps the block from being selected
    /// again before the final report lands.
    pub fn initial(key: &EventKey, block: &str) -> Self {
        Self::new(key, block, 1, None)
    }

    pub fn final_totals(key: &EventKey, block: &str, gallons: u64, flow: u32) -> Self {
        Self::new(key, block, gallons, Some(flow))
    }

    fn new(key: &EventKey, block: &str, gallons: u64, flow: Option<u32>) -> Self {
        Self {
            whatami: REPORT_WHATAMI.to_string(),
            date: key.date,
            sched_id: key.schedule_id,
            sequence: key.sequence,
            block: block.to_string(),
            gallons,
            flow,
        }
    }

    pub fn file_name(key: &EventKey, kind: ReportKind) -> String {
        format!("gals_disp_{}_{}.json", key.stem(), kind.suffix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmDirection {
    Under,
    Over,
}

impl fmt::Display for AlarmDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmDirection::Under => f.write_str("under"),
            AlarmDirection::Over => f.write_str("over"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowAlarm {
    pub whatami: String,
    pub date: NaiveDate,
    pub sched_id: u32,
    pub sequence: u32,
    pub block: String,
    pub direction: AlarmDirection,
    /// Whole-percent deviation from the expected flow
    pub percent: u32,
    pub flow: u32,
    pub exp_flow: u32,
}

impl FlowAlarm {
    pub fn new(
        key: &EventKey,
        block: &str,
        direction: AlarmDirection,
        percent: u32,
        flow: u32,
        exp_flow: u32,
    ) -> Self {
        Self {
            whatami: FLOW_ALARM_WHATAMI.to_string(),
            date: key.date,
            sched_id: key.schedule_id,
            sequence: key.sequence,
            block: block.to_string(),
            direction,
            percent,
            flow,
            exp_flow,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "alarm_{}_{}.json",
            self.direction,
            crate::models::event::event_stem(self.date, self.sched_id, self.sequence)
        )
    }
}

/// Hardware or process failure that stopped irrigation from happening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultAlarm {
    pub whatami: String,
    pub kind: String,
    pub date: NaiveDate,
    pub detail: String,
}

impl FaultAlarm {
    pub fn new(kind: &str, date: NaiveDate, detail: impl Into<String>) -> Self {
        Self {
            whatami: FAULT_ALARM_WHATAMI.to_string(),
            kind: kind.to_string(),
            date,
            detail: detail.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("alarm_fault_{}_{}.json", self.kind, self.date.format("%Y_%m_%d"))
    }
}
