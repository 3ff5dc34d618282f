//! Supervision of one irrigation event from valve-open to final report.
//!
//! Phases follow [`EventPhase`]: `Starting` makes the valves safe, resumes
//! any checkpoint for the event, opens the block and registers; `Running`
//! applies pulses as they arrive, checkpoints on a fixed interval and
//! looks for a stop request after every pulse and every `stop_poll`;
//! `StoppingGraceful` closes the valves and does the final accounting.
//! A forced stop kills this process outright, and the next orphan sweep
//! does the accounting instead.

pub mod orphans;
pub mod shutdown;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Outcome;
use crate::flow::pulse::Received;
use crate::flow::{self, pulse_channel, FlowCounter, PulseReceiver};
use crate::fs::WorkDir;
use crate::hardware::{Hardware, PulseHandle};
use crate::models::{
    AlarmDirection, EventPhase, EventPlan, FaultAlarm, FlowAlarm, GallonsReport, ReportKind,
};
use crate::outbox::Outbox;
use crate::process::current_pid;
use crate::registry::ProcessRegistry;

pub use orphans::{live_event_stems, recover_orphans};
pub use shutdown::{StopReason, StopSignals};

/// What a supervisor did, returned when it reaches `Ended`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub reason: StopReason,
    pub gallons: u64,
    /// `None` when there was no flow data to report
    pub flow: Option<u32>,
    pub report: Outcome<GallonsReport>,
    pub dropped_pulses: u64,
}

pub struct EventSupervisor {
    config: Config,
    work_dir: WorkDir,
    plan: EventPlan,
    hardware: Hardware,
    registry: ProcessRegistry,
    outbox: Outbox,
    signals: StopSignals,
    pid: u32,
    phase: EventPhase,
    alarmed: (bool, bool),
}

impl EventSupervisor {
    pub fn new(config: Config, work_dir: WorkDir, plan: EventPlan, hardware: Hardware) -> Self {
        let registry = ProcessRegistry::new(&work_dir);
        let outbox = Outbox::new(&work_dir);
        let signals = StopSignals::new(work_dir.clone(), Arc::new(AtomicBool::new(false)));

        Self {
            config,
            work_dir,
            plan,
            hardware,
            registry,
            outbox,
            signals,
            pid: current_pid(),
            phase: EventPhase::Starting,
            alarmed: (false, false),
        }
    }

    /// Also stop when `flag` is raised (operator interrupt).
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.signals = StopSignals::new(self.work_dir.clone(), flag);
        self
    }

    pub fn phase(&self) -> EventPhase {
        self.phase
    }

    fn transition(&mut self, next: EventPhase) -> Result<()> {
        self.phase = self.phase.try_transition(next)?;
        debug!(phase = %self.phase, key = %self.plan.key, "event phase");
        Ok(())
    }

    /// Run the event to completion.
    ///
    /// Errors are returned only from `Starting`, after the valves have been
    /// closed again; once `Running` is reached the event always ends with a
    /// summary.
    pub fn run(mut self) -> Result<EventSummary> {
        let (counter, mut pulses, receiver) = self.start()?;
        self.transition(EventPhase::Running)?;

        let (counter, reason) = self.supervise(counter, &receiver);

        self.transition(EventPhase::StoppingGraceful)?;
        pulses.stop();
        let summary = self.finish(counter, &receiver, reason);
        self.transition(EventPhase::Ended)?;

        Ok(summary)
    }

    fn start(&mut self) -> Result<(FlowCounter, PulseHandle, PulseReceiver)> {
        let key = self.plan.key.clone();
        let block = self.plan.block().to_string();
        info!(%key, block = %block, end = %self.plan.end, "starting irrigation event");

        if let Err(e) = self.hardware.valves.close_all() {
            self.fault("valve", format!("could not close valves: {e}"));
            return Err(e).context("Valves not under control; irrigation not attempted");
        }

        let (counter, recovered) =
            FlowCounter::open(&self.config, &self.work_dir, &key, &block, self.pid)?;
        if let Outcome::Failed(reason) = &recovered {
            warn!(%key, %reason, "previous pulse count unusable; counting from zero");
        }

        if let Err(e) = self.hardware.valves.open(&block) {
            self.fault("valve", format!("could not open block {block}: {e}"));
            self.close_valves();
            self.phase = self.phase.try_transition(EventPhase::StoppingGraceful)?;
            return Err(e).with_context(|| format!("Failed to open valve for block {block}"));
        }

        let initial = GallonsReport::initial(&key, &block);
        if let Err(e) = self.outbox.send_report(&key, ReportKind::Initial, &initial) {
            error!(error = %format!("{e:#}"), "could not queue initial report");
        }

        if let Err(e) = self.registry.add(self.pid, key.clone()) {
            self.close_valves();
            self.phase = self.phase.try_transition(EventPhase::StoppingGraceful)?;
            return Err(e).context("Failed to register event supervisor");
        }

        let (sender, receiver) = pulse_channel(self.config.pulse_channel_capacity);
        let pulses = match self.hardware.pulses.start(sender) {
            Ok(handle) => handle,
            Err(e) => {
                self.fault("flow_sensor", format!("{e:#}"));
                self.close_valves();
                if let Err(e) = self.registry.remove(self.pid) {
                    warn!(error = %format!("{e:#}"), "could not deregister");
                }
                self.phase = self.phase.try_transition(EventPhase::StoppingGraceful)?;
                return Err(e).context("Flow sensor unavailable; irrigation not attempted");
            }
        };

        if let Err(e) = counter.checkpoint() {
            error!(error = %format!("{e:#}"), "initial checkpoint failed");
        }

        Ok((counter, pulses, receiver))
    }

    fn supervise(&mut self, mut counter: FlowCounter, receiver: &PulseReceiver) -> (FlowCounter, StopReason) {
        let interval = self.config.checkpoint_interval();

        loop {
            let checkpoint_at = Instant::now() + interval.min(until(self.plan.end));
            let stop = self.apply_pulses_until(&mut counter, receiver, checkpoint_at);

            if let Err(e) = counter.checkpoint() {
                error!(error = %format!("{e:#}"), "could not checkpoint pulse count");
            }

            if let Some(reason) = stop {
                info!(key = %self.plan.key, ?reason, "stop requested");
                return (counter, reason);
            }
            if now() >= self.plan.end {
                return (counter, StopReason::Completed);
            }
        }
    }

    /// Record pulses until `checkpoint_at`. Stop signals are checked after
    /// every pulse and at least every `stop_poll` when the meter is quiet.
    fn apply_pulses_until(
        &mut self,
        counter: &mut FlowCounter,
        receiver: &PulseReceiver,
        checkpoint_at: Instant,
    ) -> Option<StopReason> {
        let poll = self.config.stop_poll();

        loop {
            let wake = checkpoint_at.min(Instant::now() + poll);
            match receiver.recv_until(wake) {
                Received::Pulse(pulse) => {
                    counter.record(pulse);
                    self.check_flow(counter);
                }
                Received::Deadline => {}
                Received::Closed => std::thread::sleep(wake.saturating_duration_since(Instant::now())),
            }

            if let Some(reason) = self.signals.check() {
                return Some(reason);
            }
            if Instant::now() >= checkpoint_at {
                return None;
            }
        }
    }

    fn check_flow(&mut self, counter: &FlowCounter) {
        let Some(rate) = counter.current_rate(self.config.flow_check_window_secs) else {
            return;
        };
        let Some((direction, percent)) = flow::check_flow(rate, &self.plan.event) else {
            return;
        };

        let already = match direction {
            AlarmDirection::Under => &mut self.alarmed.0,
            AlarmDirection::Over => &mut self.alarmed.1,
        };
        if *already {
            return;
        }
        *already = true;

        let alarm = FlowAlarm::new(
            &self.plan.key,
            self.plan.block(),
            direction,
            percent,
            rate,
            self.plan.event.exp_flow,
        );
        if let Err(e) = self.outbox.send_flow_alarm(&alarm) {
            error!(error = %format!("{e:#}"), "could not queue flow alarm");
        }
    }

    fn finish(&mut self, mut counter: FlowCounter, receiver: &PulseReceiver, reason: StopReason) -> EventSummary {
        self.close_valves();

        for pulse in receiver.drain() {
            counter.record(pulse);
        }
        if let Err(e) = counter.checkpoint() {
            error!(error = %format!("{e:#}"), "final checkpoint failed");
        }

        let key = self.plan.key.clone();
        let gallons = counter.total_gallons();
        let flow = counter.average_flow_rate().ok();

        let report = match flow {
            Some(flow) => {
                let report = GallonsReport::final_totals(&key, self.plan.block(), gallons, flow);
                match self.outbox.send_report(&key, ReportKind::Final, &report) {
                    Ok(_) => {
                        if let Err(e) = counter.delete_files() {
                            warn!(error = %format!("{e:#}"), "could not delete checkpoint");
                        }
                        Outcome::Succeeded(report)
                    }
                    // checkpoint stays; the next orphan sweep retries
                    Err(e) => Outcome::failed(format!("{e:#}")),
                }
            }
            None => {
                warn!(%key, "no flow data; quarantining checkpoint");
                if let Err(e) = counter.quarantine_files(&self.work_dir.orphans_dir()) {
                    error!(error = %format!("{e:#}"), "could not quarantine checkpoint");
                }
                Outcome::failed("no flow data")
            }
        };

        if let Err(e) = self.registry.remove(self.pid) {
            error!(error = %format!("{e:#}"), "could not remove registry entry");
        }

        let mut exclude: HashSet<String> = live_event_stems(&self.registry);
        exclude.insert(key.stem());
        match recover_orphans(&self.config, &self.work_dir, &exclude) {
            Ok(swept) if !swept.is_empty() => info!(count = swept.len(), "swept orphaned events"),
            Ok(_) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "orphan sweep failed"),
        }

        let dropped_pulses = receiver.dropped();
        if dropped_pulses > 0 {
            warn!(dropped = dropped_pulses, "pulses dropped by full channel");
        }

        info!(%key, gallons, ?flow, ?reason, "irrigation event ended");
        EventSummary {
            reason,
            gallons,
            flow,
            report,
            dropped_pulses,
        }
    }

    fn close_valves(&mut self) {
        if let Err(e) = self.hardware.valves.close_all() {
            self.fault("valve", format!("could not close valves: {e}"));
        }
    }

    fn fault(&self, kind: &str, detail: String) {
        let alarm = FaultAlarm::new(kind, now().date(), detail);
        if let Err(e) = self.outbox.send_fault(&alarm) {
            error!(error = %format!("{e:#}"), "could not queue fault alarm");
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Wall-clock time left until `end`, zero if already past.
fn until(end: NaiveDateTime) -> Duration {
    (end - now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::durable;
    use crate::hardware::{DryRunValveBank, NoPulses, ScriptedPulses, ValveAction};
    use crate::models::{DayKey, EventKey, HourMinute, ScheduledEvent};
    use crate::flow::Pulse;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config, WorkDir) {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = WorkDir::new(temp_dir.path());
        work_dir.ensure().unwrap();
        let config = Config {
            root: temp_dir.path().to_path_buf(),
            checkpoint_interval_secs: 1,
            ..Config::default()
        };
        (temp_dir, config, work_dir)
    }

    fn plan(block: &str, secs: i64) -> EventPlan {
        let start = now();
        EventPlan {
            key: EventKey {
                date: start.date(),
                day: DayKey::Day1,
                sequence: 1,
                schedule_id: 8,
            },
            event: ScheduledEvent {
                sequence: 1,
                block: block.to_string(),
                start: HourMinute::new(0, 0),
                duration: HourMinute::new(0, 1),
                exp_flow: 15,
                over_flow_tol: 10,
                under_flow_tol: 10,
            },
            start,
            end: start + chrono::Duration::seconds(secs),
        }
    }

    fn hardware(config: &Config, pulses: Box<dyn crate::hardware::PulseSource>) -> (Hardware, Arc<std::sync::Mutex<Vec<ValveAction>>>) {
        let bank = DryRunValveBank::new(config.valves.keys().cloned());
        let actions = bank.actions_handle();
        (
            Hardware {
                valves: Box::new(bank),
                pulses,
            },
            actions,
        )
    }

    #[test]
    fn test_event_runs_to_completion() {
        let (_temp_dir, config, work_dir) = setup();
        let base = now().and_utc().timestamp() - 1300;
        let script = (1..=20).map(|i| Pulse { ts: base + i * 60 }).collect();
        let (hw, actions) = hardware(&config, Box::new(ScriptedPulses::new(script)));
        let plan = plan("c", 1);
        let key = plan.key.clone();

        let summary = EventSupervisor::new(config, work_dir.clone(), plan, hw)
            .run()
            .unwrap();

        assert_eq!(summary.reason, StopReason::Completed);
        assert_eq!(summary.gallons, 20);
        assert_eq!(summary.flow, Some(1));
        assert!(summary.report.is_succeeded());

        let actions = actions.lock().unwrap().clone();
        assert_eq!(actions.first(), Some(&ValveAction::CloseAll));
        assert_eq!(actions[1], ValveAction::Open("c".to_string()));
        assert_eq!(actions.last(), Some(&ValveAction::CloseAll));

        assert!(work_dir
            .gals_disp_dir()
            .join(GallonsReport::file_name(&key, ReportKind::Initial))
            .exists());
        assert!(work_dir
            .gals_disp_dir()
            .join(GallonsReport::file_name(&key, ReportKind::Final))
            .exists());
        assert!(!work_dir
            .in_progress_dir()
            .join(key.checkpoint_file_name())
            .exists());
        assert!(ProcessRegistry::new(&work_dir).get().unwrap().is_none());
    }

    #[test]
    fn test_stop_semaphore_ends_event_early() {
        let (_temp_dir, config, work_dir) = setup();
        let (hw, _) = hardware(&config, Box::new(NoPulses));
        shutdown::request_stop(&work_dir).unwrap();

        let started = Instant::now();
        let summary = EventSupervisor::new(config, work_dir, plan("a", 3600), hw)
            .run()
            .unwrap();

        assert_eq!(summary.reason, StopReason::StopRequested);
        assert!(started.elapsed() < Duration::from_secs(30));
        // no pulses: nothing to report, files quarantined
        assert!(summary.report.is_failed());
        assert_eq!(summary.flow, None);
    }

    #[test]
    fn test_stop_noticed_between_checkpoints() {
        let (_temp_dir, config, work_dir) = setup();
        let config = Config {
            checkpoint_interval_secs: 300,
            ..config
        };
        let (hw, _) = hardware(&config, Box::new(NoPulses));
        let supervisor = EventSupervisor::new(config.clone(), work_dir.clone(), plan("a", 60), hw);

        let handle = std::thread::spawn(move || supervisor.run());
        let registry = ProcessRegistry::new(&work_dir);
        let started = Instant::now();
        while registry.get().unwrap().is_none() {
            assert!(started.elapsed() < Duration::from_secs(10), "supervisor never registered");
            std::thread::sleep(Duration::from_millis(20));
        }

        let requested = Instant::now();
        shutdown::request_stop(&work_dir).unwrap();
        let summary = handle.join().unwrap().unwrap();

        assert_eq!(summary.reason, StopReason::StopRequested);
        assert!(requested.elapsed() < config.stop_wait() * config.stop_wait_cycles);
        assert!(registry.get().unwrap().is_none());
    }

    #[test]
    fn test_over_flow_alarm_raised() {
        let (_temp_dir, config, work_dir) = setup();
        let base = now().and_utc().timestamp() - 3600;
        // 17 pulses per minute for three minutes
        let script = (0..=51).map(|i| Pulse { ts: base + i * 60 / 17 }).collect();
        let (hw, _) = hardware(&config, Box::new(ScriptedPulses::new(script)));
        let plan = plan("b", 1);
        let key = plan.key.clone();

        EventSupervisor::new(config, work_dir.clone(), plan, hw)
            .run()
            .unwrap();

        let alarm_path = work_dir
            .alarms_dir()
            .join(format!("alarm_over_{}.json", key.stem()));
        let alarm: FlowAlarm = durable::read(&alarm_path).unwrap().present().unwrap();
        assert_eq!(alarm.direction, AlarmDirection::Over);
        assert!(alarm.percent >= 10);
    }

    #[test]
    fn test_unknown_block_raises_fault_and_closes_valves() {
        let (_temp_dir, config, work_dir) = setup();
        let (hw, actions) = hardware(&config, Box::new(NoPulses));

        let result = EventSupervisor::new(config, work_dir.clone(), plan("z", 60), hw).run();

        assert!(result.is_err());
        assert_eq!(
            *actions.lock().unwrap(),
            vec![ValveAction::CloseAll, ValveAction::CloseAll]
        );
        let faults = crate::fs::quarantine::list_files(&work_dir.alarms_dir()).unwrap();
        assert_eq!(faults.len(), 1);
        assert!(ProcessRegistry::new(&work_dir).get().unwrap().is_none());
    }
}
