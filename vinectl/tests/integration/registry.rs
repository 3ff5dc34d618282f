//! Process registry and pulse-count recovery across process restarts.

use chrono::NaiveDate;
use std::process::Command;
use tempfile::TempDir;
use vinectl::config::Config;
use vinectl::error::Outcome;
use vinectl::flow::{FlowCounter, Pulse};
use vinectl::fs::WorkDir;
use vinectl::models::{DayKey, EventKey, ReportKind, GallonsReport};
use vinectl::registry::ProcessRegistry;
use vinectl::supervisor::recover_orphans;

fn key(sequence: u32) -> EventKey {
    EventKey {
        date: NaiveDate::from_ymd_opt(2021, 7, 22).unwrap(),
        day: DayKey::Thu,
        sequence,
        schedule_id: 6,
    }
}

fn setup() -> (TempDir, Config, WorkDir) {
    let temp_dir = TempDir::new().unwrap();
    let work_dir = WorkDir::new(temp_dir.path());
    work_dir.ensure().unwrap();
    let config = Config {
        root: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    (temp_dir, config, work_dir)
}

#[test]
fn test_registry_add_remove_round_trip() {
    let (_temp_dir, _config, work_dir) = setup();
    let registry = ProcessRegistry::new(&work_dir);

    registry.add(4242, key(1)).unwrap();
    assert!(registry.contains(4242).unwrap());
    assert_eq!(registry.get().unwrap().unwrap().get(&4242), Some(&key(1)));

    assert!(registry.remove(4242).unwrap());
    assert!(registry.get().unwrap().is_none());
    assert!(!work_dir.registry_path().exists());
}

#[test]
fn test_clear_all_terminates_live_entries() {
    let (_temp_dir, _config, work_dir) = setup();
    let registry = ProcessRegistry::new(&work_dir);
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    registry.add(child.id(), key(1)).unwrap();

    let outcome = registry.clear_all();

    assert_eq!(outcome, Outcome::Succeeded(vec![child.id()]));
    child.wait().unwrap();
    assert!(registry.get().unwrap().map_or(true, |map| map.is_empty()));
}

#[test]
fn test_clear_all_on_empty_registry_not_attempted() {
    let (_temp_dir, _config, work_dir) = setup();
    let registry = ProcessRegistry::new(&work_dir);
    assert_eq!(registry.clear_all(), Outcome::NotAttempted);
}

#[test]
fn test_count_survives_restart() {
    let (_temp_dir, config, work_dir) = setup();
    let base = 1_626_940_800;

    let (mut first, opened) = FlowCounter::open(&config, &work_dir, &key(2), "b", 1000).unwrap();
    assert_eq!(opened, Outcome::NotAttempted);
    for i in 1..=12 {
        first.record(Pulse { ts: base + i * 60 });
    }
    first.checkpoint().unwrap();
    drop(first);

    let (mut second, resumed) = FlowCounter::open(&config, &work_dir, &key(2), "b", 1001).unwrap();
    assert_eq!(resumed, Outcome::Succeeded(1));
    for i in 1..=5 {
        second.record(Pulse { ts: base + 1000 + i * 60 });
    }
    second.checkpoint().unwrap();

    assert_eq!(second.total_gallons(), 17);
    assert_eq!(second.checkpoint_data().generations.len(), 2);
    assert_eq!(second.checkpoint_data().generations[0].pid, 1000);
    assert_eq!(second.checkpoint_data().generations[1].pid, 1001);
}

#[test]
fn test_orphaned_checkpoint_gets_final_report() {
    let (_temp_dir, config, work_dir) = setup();
    let base = 1_626_940_800;

    let (mut counter, _) = FlowCounter::open(&config, &work_dir, &key(3), "d", 1000).unwrap();
    for i in 1..=30 {
        counter.record(Pulse { ts: base + i * 4 });
    }
    counter.checkpoint().unwrap();
    drop(counter);

    let swept = recover_orphans(&config, &work_dir, &Default::default()).unwrap();

    let report = swept[&key(3).stem()].clone().succeeded().unwrap();
    assert_eq!(report.gallons, 30);
    assert!(work_dir
        .gals_disp_dir()
        .join(GallonsReport::file_name(&key(3), ReportKind::Final))
        .exists());
    assert!(!work_dir
        .in_progress_dir()
        .join(key(3).checkpoint_file_name())
        .exists());
}
