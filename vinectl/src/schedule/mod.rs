//! Schedules: what is in force, how new ones arrive, and what should run.

pub mod engine;
pub mod fetch;
pub mod reset;
pub mod store;
pub mod validation;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Outcome, ScheduleError};
use crate::models::Schedule;

pub use engine::{plan_at, Decision, Running, ScheduleEngine, Usability};
pub use fetch::{FetchResponse, HttpScheduleSource, ScheduleSource};
pub use reset::{software_reset, ResetReport};
pub use store::{ScheduleStore, TidyReport};
pub use validation::{parse_schedule, validate};

/// Read, unwrap and decode a schedule document from a local file.
pub fn load_schedule_file(path: &Path) -> Result<Schedule> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read schedule file: {}", path.display()))?;
    let body: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Schedule file is not JSON: {}", path.display()))?;
    let document = fetch::unwrap_document(body)?;
    Ok(parse_schedule(&document)?)
}

/// Ask `source` for a newer schedule and put it in force if it passes
/// validation and differs from the current one.
///
/// `Succeeded(None)` covers both "no newer schedule" and an identical
/// offer. When nothing is in force the default schedule's identity is
/// sent, so the backend can supply a real one.
pub fn fetch_update(
    source: &dyn ScheduleSource,
    store: &ScheduleStore,
    config: &Config,
    now_ts: i64,
) -> Outcome<Option<PathBuf>> {
    let descriptor = match store.current_descriptor() {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => Schedule::default_schedule().descriptor(),
        Err(e) => return Outcome::failed(format!("{e:#}")),
    };

    let document = match source.fetch(&descriptor, now_ts) {
        Ok(FetchResponse::NoNewer) => {
            info!(id = descriptor.id, "no newer schedule available");
            return Outcome::Succeeded(None);
        }
        Ok(FetchResponse::Candidate(document)) => document,
        Err(e) => {
            error!(error = %format!("{e:#}"), "schedule fetch failed");
            return Outcome::failed(format!("{e:#}"));
        }
    };

    let schedule = match parse_schedule(&document) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!(error = %e, "downloaded schedule rejected");
            return Outcome::failed(e);
        }
    };

    match store.install(&schedule, config) {
        Ok(path) => {
            info!(
                id = schedule.id(),
                kind = %schedule.kind(),
                "new schedule installed"
            );
            Outcome::Succeeded(Some(path))
        }
        Err(e) if e.downcast_ref::<ScheduleError>() == Some(&ScheduleError::Identical) => {
            info!(id = schedule.id(), "offered schedule is already in force");
            Outcome::Succeeded(None)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "downloaded schedule not installed");
            Outcome::failed(format!("{e:#}"))
        }
    }
}
