//! Controller reconciliation and software reset.

use chrono::{Local, NaiveDate, NaiveDateTime};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vinectl::config::Config;
use vinectl::controller::{Controller, EventLauncher, RecordingLauncher};
use vinectl::error::Outcome;
use vinectl::flow::Pulse;
use vinectl::fs::durable::{self, Record};
use vinectl::fs::WorkDir;
use vinectl::hardware::{DryRunValveBank, Hardware, ScriptedPulses, ValveAction};
use vinectl::models::schedule::{FixedDay, FixedSchedule};
use vinectl::models::{
    DayKey, EventKey, EventList, EventPlan, GallonsReport, HourMinute, ReportKind, Schedule,
    ScheduledEvent,
};
use vinectl::registry::ProcessRegistry;
use vinectl::schedule::Decision;
use vinectl::supervisor::{EventSupervisor, StopReason};

// 2021-07-22 is a Thursday
fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 7, 22)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

fn thursday_schedule() -> Schedule {
    let event = |sequence: u32, block: &str, start: u32| ScheduledEvent {
        sequence,
        block: block.to_string(),
        start: HourMinute::new(start, 0),
        duration: HourMinute::new(2, 0),
        exp_flow: 15,
        over_flow_tol: 10,
        under_flow_tol: 10,
    };
    match Schedule::default_schedule() {
        Schedule::Fixed(s) => Schedule::Fixed(FixedSchedule {
            id: 7,
            name: "thursday".to_string(),
            thu: FixedDay(EventList::Events(vec![
                event(1, "a", 8),
                event(2, "b", 10),
            ])),
            ..s
        }),
        other => other,
    }
}

fn event_one_key() -> EventKey {
    EventKey {
        date: now().date(),
        day: DayKey::Thu,
        sequence: 1,
        schedule_id: 7,
    }
}

fn setup_with(stop_wait_cycles: u32, stop_wait_secs: u64) -> (TempDir, WorkDir, Controller, Arc<Mutex<Vec<ValveAction>>>) {
    let temp_dir = TempDir::new().unwrap();
    let work_dir = WorkDir::new(temp_dir.path());
    work_dir.ensure().unwrap();
    let config = Config {
        root: temp_dir.path().to_path_buf(),
        stop_wait_cycles,
        stop_wait_secs,
        ..Config::default()
    };
    let bank = DryRunValveBank::new(config.valves.keys().cloned());
    let actions = bank.actions_handle();
    let controller = Controller::new(config, work_dir.clone(), Box::new(bank));
    (temp_dir, work_dir, controller, actions)
}

fn setup() -> (TempDir, WorkDir, Controller, Arc<Mutex<Vec<ValveAction>>>) {
    setup_with(1, 0)
}

/// Records, at launch time, the previous event's last valve action and
/// whether it was still registered.
struct AfterStopLauncher {
    work_dir: WorkDir,
    previous_valves: Arc<Mutex<Vec<ValveAction>>>,
    launched: Vec<(EventPlan, Option<ValveAction>, bool)>,
}

impl EventLauncher for AfterStopLauncher {
    fn launch(&mut self, plan: EventPlan) -> anyhow::Result<()> {
        let last = self.previous_valves.lock().unwrap().last().cloned();
        let registered = ProcessRegistry::new(&self.work_dir).get()?.is_some();
        self.launched.push((plan, last, registered));
        Ok(())
    }
}

fn put_schedule(work_dir: &WorkDir, schedule: &Schedule) {
    let path = work_dir.schedule_current_dir().join(schedule.file_name());
    durable::write(&path, schedule).unwrap();
}

#[test]
fn test_idle_schedule_starts_due_event() {
    let (_temp_dir, work_dir, mut controller, _) = setup();
    put_schedule(&work_dir, &thursday_schedule());
    let mut launcher = RecordingLauncher::default();

    let decision = controller.reconcile(now(), &mut launcher).unwrap();

    assert!(matches!(decision, Decision::Start(_)));
    assert_eq!(launcher.launched.len(), 1);
    assert_eq!(launcher.launched[0].block(), "b");
    assert_eq!(launcher.launched[0].key.sequence, 2);
}

#[test]
fn test_running_event_replaced_by_next() {
    let (_temp_dir, work_dir, mut controller, actions) = setup();
    put_schedule(&work_dir, &thursday_schedule());

    // a stand-in supervisor still holding event 1, which ended at 10:00
    let mut stale = Command::new("sleep").arg("30").spawn().unwrap();
    let old_key = event_one_key();
    ProcessRegistry::new(&work_dir)
        .add(stale.id(), old_key.clone())
        .unwrap();
    let mut launcher = RecordingLauncher::default();

    let decision = controller.reconcile(now(), &mut launcher).unwrap();

    stale.wait().unwrap();
    match decision {
        Decision::Replace { pid, key, start } => {
            assert_eq!(pid, stale.id());
            assert_eq!(key, old_key);
            assert_eq!(start.key.sequence, 2);
        }
        other => panic!("expected replace, got {other:?}"),
    }
    assert_eq!(*actions.lock().unwrap(), vec![ValveAction::CloseAll]);
    assert_eq!(launcher.launched.len(), 1);
    assert_eq!(launcher.launched[0].block(), "b");
    assert!(!work_dir.stop_semaphore_path().exists());
}

#[test]
fn test_running_supervisor_stops_before_next_starts() {
    let (_temp_dir, work_dir, mut controller, controller_valves) = setup_with(5, 1);
    put_schedule(&work_dir, &thursday_schedule());

    let config = Config {
        root: work_dir.root().to_path_buf(),
        ..Config::default()
    };
    let bank = DryRunValveBank::new(config.valves.keys().cloned());
    let supervisor_valves = bank.actions_handle();
    let base = Local::now().timestamp() - 1300;
    let pulses = (1..=20).map(|i| Pulse { ts: base + i * 60 }).collect();
    let hardware = Hardware {
        valves: Box::new(bank),
        pulses: Box::new(ScriptedPulses::new(pulses)),
    };
    let started = Local::now().naive_local();
    let plan = EventPlan {
        key: event_one_key(),
        event: match thursday_schedule() {
            Schedule::Fixed(s) => match s.thu.0 {
                EventList::Events(events) => events[0].clone(),
                other => panic!("unexpected day {other:?}"),
            },
            other => panic!("unexpected schedule {other:?}"),
        },
        start: started,
        end: started + chrono::Duration::seconds(120),
    };

    let supervisor = EventSupervisor::new(config, work_dir.clone(), plan, hardware);
    let handle = thread::spawn(move || supervisor.run());
    let registry = ProcessRegistry::new(&work_dir);
    let waiting = Instant::now();
    while registry.get().unwrap().is_none() {
        assert!(waiting.elapsed() < Duration::from_secs(10), "supervisor never registered");
        thread::sleep(Duration::from_millis(20));
    }

    let mut launcher = AfterStopLauncher {
        work_dir: work_dir.clone(),
        previous_valves: Arc::clone(&supervisor_valves),
        launched: Vec::new(),
    };
    let reconcile_started = Instant::now();
    let decision = controller.reconcile(now(), &mut launcher).unwrap();
    let summary = handle.join().unwrap().unwrap();

    assert!(matches!(decision, Decision::Replace { .. }));
    assert!(reconcile_started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.reason, StopReason::StopRequested);
    assert_eq!(summary.gallons, 20);
    assert!(summary.report.is_succeeded());
    assert!(work_dir
        .gals_disp_dir()
        .join(GallonsReport::file_name(&event_one_key(), ReportKind::Final))
        .exists());

    // stopped cooperatively: the kill path would have closed valves here
    assert!(controller_valves.lock().unwrap().is_empty());
    assert_eq!(
        *supervisor_valves.lock().unwrap(),
        vec![
            ValveAction::CloseAll,
            ValveAction::Open("a".to_string()),
            ValveAction::CloseAll
        ]
    );

    assert_eq!(launcher.launched.len(), 1);
    let (next, last_valve_action, still_registered) = &launcher.launched[0];
    assert_eq!(next.block(), "b");
    assert_eq!(*last_valve_action, Some(ValveAction::CloseAll));
    assert!(!still_registered);
    assert!(!work_dir.stop_semaphore_path().exists());
}

#[test]
fn test_reset_restores_default_schedule() {
    let (_temp_dir, work_dir, mut controller, actions) = setup();
    put_schedule(&work_dir, &thursday_schedule());
    ProcessRegistry::new(&work_dir)
        .add(u32::MAX - 1, EventKey {
            date: now().date(),
            day: DayKey::Thu,
            sequence: 1,
            schedule_id: 7,
        })
        .unwrap();

    let outcome = controller.reset(now());

    assert!(outcome.is_succeeded());
    assert_eq!(
        controller.engine().store().current().unwrap(),
        Record::Present(Schedule::default_schedule())
    );
    assert!(ProcessRegistry::new(&work_dir).get().unwrap().is_none());
    assert_eq!(*actions.lock().unwrap(), vec![ValveAction::CloseAll]);
}

#[test]
fn test_stop_without_running_event() {
    let (_temp_dir, _work_dir, mut controller, _) = setup();
    assert_eq!(controller.stop_current_event(now()), Outcome::NotAttempted);
}
