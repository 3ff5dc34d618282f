//! Deciding what should be irrigating right now.

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use std::fmt;
use tracing::{debug, warn};

use crate::fs::durable::Record;
use crate::fs::WorkDir;
use crate::models::{EventKey, EventPlan, Schedule};
use crate::registry::ProcessRegistry;

use super::store::ScheduleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Valid,
    Expired,
    /// No readable schedule in force
    Unknown,
}

impl fmt::Display for Usability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usability::Valid => write!(f, "valid"),
            Usability::Expired => write!(f, "expired"),
            Usability::Unknown => write!(f, "unknown"),
        }
    }
}

/// What the registry says is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Running {
    Nothing,
    Event { pid: u32, key: EventKey },
    /// More than one live entry; never a supported state
    Conflict(Vec<u32>),
}

/// The action that brings the system in line with the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Idle,
    KeepRunning { pid: u32, key: EventKey },
    Start(EventPlan),
    Stop { pid: u32, key: EventKey },
    /// Stop the running event, then start `start`
    Replace {
        pid: u32,
        key: EventKey,
        start: EventPlan,
    },
    Reset(String),
}

pub struct ScheduleEngine {
    store: ScheduleStore,
    registry: ProcessRegistry,
}

impl ScheduleEngine {
    pub fn new(work_dir: &WorkDir) -> Self {
        Self {
            store: ScheduleStore::new(work_dir),
            registry: ProcessRegistry::new(work_dir),
        }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    fn schedule(&self) -> Result<Option<Schedule>> {
        match self.store.current()? {
            Record::Present(schedule) => Ok(Some(schedule)),
            Record::Corrupt(reason) => {
                warn!(%reason, "schedule in force is unreadable");
                Ok(None)
            }
            Record::Absent => Ok(None),
        }
    }

    /// Fixed schedules are always valid; intelligent ones expire after
    /// 23:59 on their third day.
    pub fn currently_usable(&self, now: NaiveDateTime) -> Usability {
        match self.schedule() {
            Ok(Some(schedule)) if schedule.is_expired_at(now) => Usability::Expired,
            Ok(Some(_)) => Usability::Valid,
            Ok(None) => Usability::Unknown,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "could not read schedule in force");
                Usability::Unknown
            }
        }
    }

    /// Live registry entries. Entries for dead processes are ignored;
    /// the orphan sweep deals with what they left behind.
    pub fn event_currently_running(&self) -> Result<Running> {
        let Some(map) = self.registry.get()? else {
            return Ok(Running::Nothing);
        };
        let mut live: Vec<(u32, EventKey)> = map
            .into_iter()
            .filter(|(pid, _)| self.registry.is_running(*pid))
            .collect();

        match live.len() {
            0 => Ok(Running::Nothing),
            1 => {
                let (pid, key) = live.remove(0);
                Ok(Running::Event { pid, key })
            }
            _ => Ok(Running::Conflict(live.into_iter().map(|(pid, _)| pid).collect())),
        }
    }

    /// The event whose `[start, start + duration)` window contains `now`.
    ///
    /// Today's bucket is searched first, then yesterday's for an event
    /// that runs past midnight.
    pub fn event_that_should_be_running(&self, now: NaiveDateTime) -> Result<Option<EventPlan>> {
        let Some(schedule) = self.schedule()? else {
            return Ok(None);
        };
        Ok(plan_at(&schedule, now))
    }

    pub fn plan(&self, now: NaiveDateTime) -> Result<Decision> {
        match self.currently_usable(now) {
            Usability::Valid => {}
            other => return Ok(Decision::Reset(format!("schedule in force is {other}"))),
        }

        let running = self.event_currently_running()?;
        let should = self.event_that_should_be_running(now)?;
        debug!(?running, should = ?should.as_ref().map(|p| &p.key), "reconciling");

        let decision = match (running, should) {
            (Running::Conflict(pids), _) => {
                Decision::Reset(format!("{} supervisors registered: {pids:?}", pids.len()))
            }
            (Running::Nothing, None) => Decision::Idle,
            (Running::Nothing, Some(plan)) => Decision::Start(plan),
            (Running::Event { pid, key }, None) => Decision::Stop { pid, key },
            (Running::Event { pid, key }, Some(plan)) if plan.key == key => {
                Decision::KeepRunning { pid, key }
            }
            (Running::Event { pid, key }, Some(plan)) => Decision::Replace {
                pid,
                key,
                start: plan,
            },
        };
        Ok(decision)
    }
}

/// Resolve `schedule` against a moment in time.
pub fn plan_at(schedule: &Schedule, now: NaiveDateTime) -> Option<EventPlan> {
    let today = now.date();
    let yesterday = today - Duration::days(1);

    [today, yesterday].into_iter().find_map(|date| {
        let (day, events) = schedule.day_plan(date)?;
        events.iter().find_map(|event| {
            let (start, end) = event.window_on(date)?;
            (start <= now && now < end).then(|| EventPlan {
                key: EventKey {
                    date,
                    day,
                    sequence: event.sequence,
                    schedule_id: schedule.id(),
                },
                event: event.clone(),
                start,
                end,
            })
        })
    })
}
