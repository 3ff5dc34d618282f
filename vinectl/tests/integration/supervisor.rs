//! Event supervisor lifecycle against dry-run hardware.

use chrono::{Duration, Local, NaiveDateTime};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use vinectl::config::Config;
use vinectl::flow::{FlowCounter, Pulse};
use vinectl::fs::WorkDir;
use vinectl::hardware::{DryRunValveBank, Hardware, NoPulses, PulseSource, ScriptedPulses, ValveAction};
use vinectl::models::{DayKey, EventKey, EventPlan, GallonsReport, HourMinute, ReportKind, ScheduledEvent};
use vinectl::registry::ProcessRegistry;
use vinectl::supervisor::{EventSupervisor, StopReason};

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

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
            day: DayKey::Day2,
            sequence: 3,
            schedule_id: 12,
        },
        event: ScheduledEvent {
            sequence: 3,
            block: block.to_string(),
            start: HourMinute::new(0, 0),
            duration: HourMinute::new(1, 0),
            exp_flow: 1,
            over_flow_tol: 50,
            under_flow_tol: 50,
        },
        start,
        end: start + Duration::seconds(secs),
    }
}

fn hardware(config: &Config, pulses: Box<dyn PulseSource>) -> (Hardware, Arc<Mutex<Vec<ValveAction>>>) {
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
fn test_interrupt_closes_valves_and_deregisters() {
    let (_temp_dir, config, work_dir) = setup();
    let (hw, actions) = hardware(&config, Box::new(NoPulses));
    let interrupt = Arc::new(AtomicBool::new(true));

    let summary = EventSupervisor::new(config, work_dir.clone(), plan("g", 3600), hw)
        .with_interrupt(interrupt)
        .run()
        .unwrap();

    assert_eq!(summary.reason, StopReason::Interrupted);
    let actions = actions.lock().unwrap().clone();
    assert_eq!(actions[1], ValveAction::Open("g".to_string()));
    assert_eq!(actions.last(), Some(&ValveAction::CloseAll));
    assert!(ProcessRegistry::new(&work_dir).get().unwrap().is_none());
}

#[test]
fn test_restarted_supervisor_continues_count() {
    let (_temp_dir, config, work_dir) = setup();
    let plan = plan("e", 1);
    let key = plan.key.clone();
    let base = now().and_utc().timestamp() - 7200;

    let (mut earlier, _) = FlowCounter::open(&config, &work_dir, &key, "e", 1).unwrap();
    for i in 1..=12 {
        earlier.record(Pulse { ts: base + i * 60 });
    }
    earlier.checkpoint().unwrap();
    drop(earlier);

    let script = (1..=5).map(|i| Pulse { ts: base + 3600 + i * 60 }).collect();
    let (hw, _) = hardware(&config, Box::new(ScriptedPulses::new(script)));

    let summary = EventSupervisor::new(config, work_dir.clone(), plan, hw)
        .run()
        .unwrap();

    assert_eq!(summary.reason, StopReason::Completed);
    assert_eq!(summary.gallons, 17);
    assert_eq!(summary.flow, Some(1));
    assert!(work_dir
        .gals_disp_dir()
        .join(GallonsReport::file_name(&key, ReportKind::Final))
        .exists());
    assert!(!work_dir
        .in_progress_dir()
        .join(key.checkpoint_file_name())
        .exists());
}
