//! One controller invocation: bring schedule, outbox and running event in
//! line with each other.
//!
//! The controller is run periodically. Each tick fetches schedule updates,
//! tidies the schedule directory, ages out undelivered files, sweeps
//! orphaned checkpoints, and finally reconciles the running event with the
//! schedule. Starting an event hands control to an [`EventLauncher`]; with
//! [`InProcessLauncher`] the tick does not return until that event ends.

pub mod launcher;

use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Outcome, ScheduleError};
use crate::fs::WorkDir;
use crate::hardware::ValveBank;
use crate::models::FaultAlarm;
use crate::outbox::Outbox;
use crate::registry::ProcessRegistry;
use crate::schedule::{
    fetch_update, software_reset, Decision, ResetReport, Running, ScheduleEngine, ScheduleSource,
};
use crate::supervisor::orphans::{live_event_stems, recover_orphans, SweepResult};
use crate::supervisor::shutdown;

pub use launcher::{EventLauncher, InProcessLauncher, RecordingLauncher};

/// What one tick did.
#[derive(Debug)]
pub struct TickReport {
    pub fetched: Outcome<Option<PathBuf>>,
    pub aged_out: usize,
    pub swept: SweepResult,
    pub decision: Decision,
}

pub struct Controller {
    config: Config,
    work_dir: WorkDir,
    engine: ScheduleEngine,
    registry: ProcessRegistry,
    outbox: Outbox,
    valves: Box<dyn ValveBank>,
    source: Option<Box<dyn ScheduleSource>>,
}

impl Controller {
    pub fn new(config: Config, work_dir: WorkDir, valves: Box<dyn ValveBank>) -> Self {
        Self {
            engine: ScheduleEngine::new(&work_dir),
            registry: ProcessRegistry::new(&work_dir),
            outbox: Outbox::new(&work_dir),
            config,
            work_dir,
            valves,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn ScheduleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn engine(&self) -> &ScheduleEngine {
        &self.engine
    }

    pub fn tick(&mut self, now: NaiveDateTime, launcher: &mut dyn EventLauncher) -> Result<TickReport> {
        self.work_dir.ensure()?;

        if shutdown::clear_stop_request(&self.work_dir)? {
            info!("removed stale stop request");
        }

        let fetched = match &self.source {
            Some(source) => fetch_update(
                source.as_ref(),
                self.engine.store(),
                &self.config,
                now.and_utc().timestamp(),
            ),
            None => Outcome::NotAttempted,
        };

        self.tidy_schedules(now)?;

        let aged_out = match self.outbox.age_out(now, self.config.report_max_age_days) {
            Ok(moved) => moved.len(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "outbox age-out failed");
                0
            }
        };

        if let Outcome::Failed(reason) = self.registry.refresh() {
            warn!(%reason, "registry refresh failed");
        }

        let swept = self.recover(now)?;
        let decision = self.reconcile(now, launcher)?;

        Ok(TickReport {
            fetched,
            aged_out,
            swept,
            decision,
        })
    }

    /// Resolve a schedule directory holding more than one file. Two fixed
    /// schedules cannot be resolved and force a reset.
    fn tidy_schedules(&mut self, now: NaiveDateTime) -> Result<()> {
        let store = self.engine.store();
        if let Err(e) = store.tidy_staged() {
            warn!(error = %format!("{e:#}"), "could not tidy staged schedules");
        }
        match store.tidy_current() {
            Ok(_) => Ok(()),
            Err(e) => match e.downcast_ref::<ScheduleError>() {
                Some(ScheduleError::ConflictingFixed { .. }) => {
                    error!(error = %e, "conflicting schedules in force");
                    if let Outcome::Failed(reason) = self.reset(now) {
                        error!(%reason, "reset after schedule conflict incomplete");
                    }
                    Ok(())
                }
                _ => Err(e),
            },
        }
    }

    /// Orphan sweep, leaving alone any checkpoint that a live supervisor
    /// owns or that the event due now would resume.
    pub fn recover(&self, now: NaiveDateTime) -> Result<SweepResult> {
        let mut exclude: HashSet<String> = live_event_stems(&self.registry);
        match self.engine.event_that_should_be_running(now) {
            Ok(Some(plan)) => {
                exclude.insert(plan.key.stem());
            }
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "could not resolve current event"),
        }
        recover_orphans(&self.config, &self.work_dir, &exclude)
    }

    /// Compare what is running with what should be, and act on the
    /// difference. A replacement is started only after the old event has
    /// stopped.
    pub fn reconcile(&mut self, now: NaiveDateTime, launcher: &mut dyn EventLauncher) -> Result<Decision> {
        let decision = self.engine.plan(now)?;
        info!(?decision, "reconcile");

        match &decision {
            Decision::Idle | Decision::KeepRunning { .. } => {}
            Decision::Stop { key, .. } => {
                if let Outcome::Failed(reason) = self.stop_current_event(now) {
                    error!(%key, %reason, "could not stop current event");
                }
            }
            Decision::Start(plan) => launcher.launch(plan.clone())?,
            Decision::Replace { key, start, .. } => match self.stop_current_event(now) {
                Outcome::Failed(reason) => {
                    error!(%key, %reason, "could not stop current event; not starting next");
                }
                _ => launcher.launch(start.clone())?,
            },
            Decision::Reset(reason) => {
                warn!(%reason, "schedule state unusable");
                if let Outcome::Failed(reason) = self.reset(now) {
                    error!(%reason, "reset of unusable schedule state incomplete");
                }
            }
        }

        Ok(decision)
    }

    /// Ask the running supervisor to stop, escalating to a kill after
    /// `stop_wait_cycles` checks `stop_wait_secs` apart.
    ///
    /// After a kill the valves are closed here, since the killed process
    /// never got to. The stop request is always removed afterwards.
    pub fn stop_current_event(&mut self, now: NaiveDateTime) -> Outcome<()> {
        match self.engine.event_currently_running() {
            Ok(Running::Nothing) => return Outcome::NotAttempted,
            Ok(_) => {}
            Err(e) => return Outcome::failed(format!("{e:#}")),
        }

        let outcome = self.stop_gracefully_or_kill(now);

        if let Err(e) = shutdown::clear_stop_request(&self.work_dir) {
            warn!(error = %format!("{e:#}"), "could not remove stop request");
        }
        outcome
    }

    fn stop_gracefully_or_kill(&mut self, now: NaiveDateTime) -> Outcome<()> {
        if let Err(e) = shutdown::request_stop(&self.work_dir) {
            warn!(error = %format!("{e:#}"), "could not write stop request");
        } else {
            for cycle in 1..=self.config.stop_wait_cycles {
                thread::sleep(self.config.stop_wait());
                if matches!(self.engine.event_currently_running(), Ok(Running::Nothing)) {
                    info!(cycle, "event stopped cooperatively");
                    return Outcome::Succeeded(());
                }
            }
            warn!(
                cycles = self.config.stop_wait_cycles,
                "supervisor did not stop in time, killing"
            );
        }

        let killed = self.registry.clear_all();
        self.close_valves(now);
        match killed {
            Outcome::Failed(reason) => {
                self.fault(now, "process", format!("could not kill supervisor: {reason}"));
                Outcome::Failed(reason)
            }
            _ => Outcome::Succeeded(()),
        }
    }

    /// Software reset, then close every valve. The valves are closed even
    /// when the reset is incomplete.
    pub fn reset(&mut self, now: NaiveDateTime) -> Outcome<ResetReport> {
        let outcome = software_reset(&self.work_dir, now.date());
        self.close_valves(now);
        outcome
    }

    fn close_valves(&mut self, now: NaiveDateTime) {
        if let Err(e) = self.valves.close_all() {
            self.fault(now, "valve", format!("could not close valves: {e}"));
        }
    }

    fn fault(&self, now: NaiveDateTime, kind: &str, detail: String) {
        let alarm = FaultAlarm::new(kind, now.date(), detail);
        if let Err(e) = self.outbox.send_fault(&alarm) {
            error!(error = %format!("{e:#}"), "could not queue fault alarm");
        }
    }
}
