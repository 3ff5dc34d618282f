//! Structural checks a schedule must pass before it is staged.

use std::collections::HashSet;

use crate::config::Config;
use crate::error::ScheduleError;
use crate::models::{DayKey, Schedule, ScheduledEvent};

/// Decode a schedule document, rejecting anything that does not match
/// one of the two schedule shapes.
pub fn parse_schedule(document: &serde_json::Value) -> Result<Schedule, ScheduleError> {
    serde_json::from_value(document.clone()).map_err(|e| ScheduleError::Malformed(e.to_string()))
}

/// Check every event of every day against the configured blocks and limits.
///
/// # Arguments
/// * `schedule` - A decoded schedule
/// * `config` - Supplies the known blocks and the longest allowed event
///
/// # Returns
/// The first problem found, or `Ok(())`.
pub fn validate(schedule: &Schedule, config: &Config) -> Result<(), ScheduleError> {
    for (day, list) in schedule.buckets() {
        let mut seen = HashSet::new();
        for event in list.events() {
            validate_event(day, event, config)?;
            if !seen.insert(event.sequence) {
                return Err(ScheduleError::DuplicateSequence {
                    day: day.to_string(),
                    sequence: event.sequence,
                });
            }
        }
    }
    Ok(())
}

fn validate_event(day: DayKey, event: &ScheduledEvent, config: &Config) -> Result<(), ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidEvent {
        day: day.to_string(),
        sequence: event.sequence,
        reason,
    };

    if event.sequence == 0 {
        return Err(invalid("sequence must be positive".to_string()));
    }
    if !config.is_known_block(&event.block) {
        return Err(invalid(format!("unknown block '{}'", event.block)));
    }
    if event.start.as_time().is_none() {
        return Err(invalid(format!("start {} is not a time of day", event.start)));
    }
    if event.duration.hours > config.max_event_hours || event.duration.minutes >= 60 {
        return Err(invalid(format!(
            "duration {} exceeds {} hours or is malformed",
            event.duration, config.max_event_hours
        )));
    }
    if event.exp_flow == 0 {
        return Err(invalid("exp_flow must be positive".to_string()));
    }
    if event.over_flow_tol == 0 || event.under_flow_tol == 0 {
        return Err(invalid("flow tolerances must be positive".to_string()));
    }
    Ok(())
}
