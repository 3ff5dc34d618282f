//! Schedule resolution, expiry and flow tolerance checks.

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;
use vinectl::flow::check_flow;
use vinectl::fs::durable;
use vinectl::fs::WorkDir;
use vinectl::models::schedule::{FixedDay, FixedSchedule, IntelDay, IntelligentSchedule};
use vinectl::models::{AlarmDirection, EventList, HourMinute, Schedule, ScheduledEvent};
use vinectl::schedule::{plan_at, ScheduleEngine, Usability};

fn at(day: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 7, day)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

fn event(block: &str, start: (u32, u32), duration: (u32, u32)) -> ScheduledEvent {
    ScheduledEvent {
        sequence: 1,
        block: block.to_string(),
        start: HourMinute::new(start.0, start.1),
        duration: HourMinute::new(duration.0, duration.1),
        exp_flow: 15,
        over_flow_tol: 10,
        under_flow_tol: 10,
    }
}

fn intel(day1: u32) -> Schedule {
    let day = |d: u32, events: EventList| IntelDay {
        date: NaiveDate::from_ymd_opt(2021, 7, d).unwrap(),
        events,
    };
    Schedule::Intelligent(IntelligentSchedule {
        id: 40,
        created_ts: 1_626_900_000,
        created_date: NaiveDate::from_ymd_opt(2021, 7, day1 - 1).unwrap(),
        day1: day(day1, EventList::Events(vec![event("f", (5, 0), (2, 0))])),
        day2: day(day1 + 1, EventList::NoIrrigation),
        day3: day(day1 + 2, EventList::NoIrrigation),
    })
}

fn install(schedule: &Schedule) -> (TempDir, ScheduleEngine) {
    let temp_dir = TempDir::new().unwrap();
    let work_dir = WorkDir::new(temp_dir.path());
    work_dir.ensure().unwrap();
    let path = work_dir.schedule_current_dir().join(schedule.file_name());
    durable::write(&path, schedule).unwrap();
    (temp_dir, ScheduleEngine::new(&work_dir))
}

#[test]
fn test_fixed_schedule_always_usable() {
    let (_temp_dir, engine) = install(&Schedule::default_schedule());
    assert_eq!(engine.currently_usable(at(1, 0, 0)), Usability::Valid);
    assert_eq!(engine.currently_usable(at(31, 23, 59)), Usability::Valid);
}

#[test]
fn test_intelligent_schedule_expires_after_last_day() {
    let (_temp_dir, engine) = install(&intel(22));

    assert_eq!(engine.currently_usable(at(22, 5, 0)), Usability::Valid);
    assert_eq!(engine.currently_usable(at(24, 23, 59)), Usability::Valid);
    assert_eq!(engine.currently_usable(at(25, 0, 0)), Usability::Expired);
}

#[test]
fn test_should_be_running_respects_window() {
    let schedule = match Schedule::default_schedule() {
        Schedule::Fixed(s) => Schedule::Fixed(FixedSchedule {
            id: 9,
            // 2021-07-26 is a Monday
            mon: FixedDay(EventList::Events(vec![event("a", (8, 0), (4, 0))])),
            ..s
        }),
        other => other,
    };
    let (_temp_dir, engine) = install(&schedule);

    assert!(engine.event_that_should_be_running(at(26, 7, 59)).unwrap().is_none());
    let plan = engine.event_that_should_be_running(at(26, 8, 0)).unwrap().unwrap();
    assert_eq!(plan.block(), "a");
    assert_eq!(plan.key.schedule_id, 9);
    assert!(engine.event_that_should_be_running(at(26, 12, 0)).unwrap().is_none());
    // Tuesday is "no-irrigation"
    assert!(engine.event_that_should_be_running(at(27, 9, 0)).unwrap().is_none());
}

#[test]
fn test_intelligent_event_resolved_on_its_date() {
    let schedule = intel(22);
    let plan = plan_at(&schedule, at(22, 6, 0)).unwrap();
    assert_eq!(plan.block(), "f");
    assert_eq!(plan.key.date, NaiveDate::from_ymd_opt(2021, 7, 22).unwrap());
    assert!(plan_at(&schedule, at(23, 6, 0)).is_none());
}

#[test]
fn test_flow_tolerance_band() {
    let event = event("a", (8, 0), (1, 0));

    assert_eq!(check_flow(17, &event), Some((AlarmDirection::Over, 13)));
    assert_eq!(check_flow(16, &event), None);
    assert_eq!(check_flow(14, &event), None);
    assert_eq!(check_flow(13, &event), Some((AlarmDirection::Under, 13)));
}
