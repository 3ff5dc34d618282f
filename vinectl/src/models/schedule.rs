use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const FIXED_WHATAMI: &str = "irrigation-schedule-fixed";
pub const INTEL_WHATAMI: &str = "irrigation-schedule-intelligent";
pub const NO_IRRIGATION: &str = "no-irrigation";

/// Identifier of a schedule day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayKey {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
    Day1,
    Day2,
    Day3,
}

impl DayKey {
    pub const WEEKDAYS: [DayKey; 7] = [
        DayKey::Mon,
        DayKey::Tue,
        DayKey::Wed,
        DayKey::Thu,
        DayKey::Fri,
        DayKey::Sat,
        DayKey::Sun,
    ];

    pub fn from_weekday(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => DayKey::Mon,
            Weekday::Tue => DayKey::Tue,
            Weekday::Wed => DayKey::Wed,
            Weekday::Thu => DayKey::Thu,
            Weekday::Fri => DayKey::Fri,
            Weekday::Sat => DayKey::Sat,
            Weekday::Sun => DayKey::Sun,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DayKey::Mon => "mon",
            DayKey::Tue => "tue",
            DayKey::Wed => "wed",
            DayKey::Thu => "thu",
            DayKey::Fri => "fri",
            DayKey::Sat => "sat",
            DayKey::Sun => "sun",
            DayKey::Day1 => "day1",
            DayKey::Day2 => "day2",
            DayKey::Day3 => "day3",
        }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mon" => Ok(DayKey::Mon),
            "tue" => Ok(DayKey::Tue),
            "wed" => Ok(DayKey::Wed),
            "thu" => Ok(DayKey::Thu),
            "fri" => Ok(DayKey::Fri),
            "sat" => Ok(DayKey::Sat),
            "sun" => Ok(DayKey::Sun),
            "day1" => Ok(DayKey::Day1),
            "day2" => Ok(DayKey::Day2),
            "day3" => Ok(DayKey::Day3),
            other => Err(format!("unknown day '{other}'")),
        }
    }
}

/// An `H:MM` value, used both for start times and durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HourMinute {
    pub hours: u32,
    pub minutes: u32,
}

impl HourMinute {
    pub fn new(hours: u32, minutes: u32) -> Self {
        Self { hours, minutes }
    }

    pub fn total_minutes(&self) -> i64 {
        i64::from(self.hours) * 60 + i64::from(self.minutes)
    }

    pub fn as_duration(&self) -> Duration {
        Duration::minutes(self.total_minutes())
    }

    /// Wall-clock time, if this is a valid time of day.
    pub fn as_time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hours, self.minutes, 0)
    }
}

impl fmt::Display for HourMinute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}", self.hours, self.minutes)
    }
}

impl FromStr for HourMinute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hours, minutes) = s
            .split_once(':')
            .ok_or_else(|| format!("'{s}' is not H:MM"))?;
        let hours = hours
            .trim()
            .parse()
            .map_err(|_| format!("'{s}' has a bad hour field"))?;
        let minutes = minutes
            .trim()
            .parse()
            .map_err(|_| format!("'{s}' has a bad minute field"))?;
        Ok(Self { hours, minutes })
    }
}

impl Serialize for HourMinute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HourMinute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub sequence: u32,
    pub block: String,
    pub start: HourMinute,
    pub duration: HourMinute,
    /// Expected flow in gallons per minute
    pub exp_flow: u32,
    pub over_flow_tol: u32,
    pub under_flow_tol: u32,
}

impl ScheduledEvent {
    /// Half-open `[start, start + duration)` window when run on `date`.
    pub fn window_on(&self, date: NaiveDate) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let start = date.and_time(self.start.as_time()?);
        Some((start, start + self.duration.as_duration()))
    }

    pub fn is_active_at(&self, date: NaiveDate, now: NaiveDateTime) -> bool {
        self.window_on(date)
            .is_some_and(|(start, end)| start <= now && now < end)
    }
}

/// Events of one day, or the explicit "no-irrigation" marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventList {
    #[default]
    NoIrrigation,
    Events(Vec<ScheduledEvent>),
}

impl EventList {
    pub fn events(&self) -> &[ScheduledEvent] {
        match self {
            EventList::NoIrrigation => &[],
            EventList::Events(events) => events,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEventList {
    Marker(String),
    Events(Vec<ScheduledEvent>),
}

fn marker<E: serde::de::Error>(raw: String) -> Result<(), E> {
    if raw == NO_IRRIGATION {
        Ok(())
    } else {
        Err(E::custom(format!("expected '{NO_IRRIGATION}', found '{raw}'")))
    }
}

impl Serialize for EventList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventList::NoIrrigation => serializer.serialize_str(NO_IRRIGATION),
            EventList::Events(events) => events.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EventList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawEventList::deserialize(deserializer)? {
            RawEventList::Marker(raw) => marker(raw).map(|_| EventList::NoIrrigation),
            RawEventList::Events(events) => Ok(EventList::Events(events)),
        }
    }
}

/// A weekday of a fixed schedule: `"no-irrigation"` or `{"events": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedDay(pub EventList);

#[derive(Serialize, Deserialize)]
struct WrappedEvents {
    events: EventList,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFixedDay {
    Marker(String),
    Wrapped(WrappedEvents),
}

impl Serialize for FixedDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            EventList::NoIrrigation => serializer.serialize_str(NO_IRRIGATION),
            events => WrappedEvents {
                events: events.clone(),
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FixedDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawFixedDay::deserialize(deserializer)? {
            RawFixedDay::Marker(raw) => marker(raw).map(|_| FixedDay(EventList::NoIrrigation)),
            RawFixedDay::Wrapped(wrapped) => Ok(FixedDay(wrapped.events)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntelDay {
    pub date: NaiveDate,
    pub events: EventList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedSchedule {
    pub id: u32,
    pub name: String,
    pub created_ts: i64,
    pub created_date: NaiveDate,
    pub mon: FixedDay,
    pub tue: FixedDay,
    pub wed: FixedDay,
    pub thu: FixedDay,
    pub fri: FixedDay,
    pub sat: FixedDay,
    pub sun: FixedDay,
}

impl FixedSchedule {
    pub fn day(&self, key: DayKey) -> Option<&EventList> {
        let day = match key {
            DayKey::Mon => &self.mon,
            DayKey::Tue => &self.tue,
            DayKey::Wed => &self.wed,
            DayKey::Thu => &self.thu,
            DayKey::Fri => &self.fri,
            DayKey::Sat => &self.sat,
            DayKey::Sun => &self.sun,
            DayKey::Day1 | DayKey::Day2 | DayKey::Day3 => return None,
        };
        Some(&day.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntelligentSchedule {
    pub id: u32,
    pub created_ts: i64,
    pub created_date: NaiveDate,
    pub day1: IntelDay,
    pub day2: IntelDay,
    pub day3: IntelDay,
}

impl IntelligentSchedule {
    pub fn days(&self) -> [(DayKey, &IntelDay); 3] {
        [
            (DayKey::Day1, &self.day1),
            (DayKey::Day2, &self.day2),
            (DayKey::Day3, &self.day3),
        ]
    }

    /// Last minute of the plan: 23:59 on day3.
    pub fn expires_at(&self) -> NaiveDateTime {
        self.day3.date.and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Fixed,
    Intelligent,
}

impl ScheduleKind {
    pub fn whatami(&self) -> &'static str {
        match self {
            ScheduleKind::Fixed => FIXED_WHATAMI,
            ScheduleKind::Intelligent => INTEL_WHATAMI,
        }
    }

    /// Token used in schedule file names.
    pub fn file_token(&self) -> &'static str {
        match self {
            ScheduleKind::Fixed => "fixed",
            ScheduleKind::Intelligent => "intel",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "whatami")]
pub enum Schedule {
    #[serde(rename = "irrigation-schedule-fixed")]
    Fixed(FixedSchedule),
    #[serde(rename = "irrigation-schedule-intelligent")]
    Intelligent(IntelligentSchedule),
}

/// Identity of a schedule as exchanged with the backend and used for the
/// "is this new?" comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub created_ts: i64,
    pub created_date: NaiveDate,
    pub id: u32,
}

impl Schedule {
    /// The reserved safe schedule: fixed, id 0, every day "no-irrigation".
    pub fn default_schedule() -> Self {
        Schedule::Fixed(FixedSchedule {
            id: 0,
            name: "default".to_string(),
            created_ts: 1_626_847_260,
            created_date: NaiveDate::from_ymd_opt(2021, 7, 21).unwrap_or(NaiveDate::MIN),
            mon: FixedDay::default(),
            tue: FixedDay::default(),
            wed: FixedDay::default(),
            thu: FixedDay::default(),
            fri: FixedDay::default(),
            sat: FixedDay::default(),
            sun: FixedDay::default(),
        })
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Fixed(_) => ScheduleKind::Fixed,
            Schedule::Intelligent(_) => ScheduleKind::Intelligent,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Schedule::Fixed(s) => s.id,
            Schedule::Intelligent(s) => s.id,
        }
    }

    pub fn created_ts(&self) -> i64 {
        match self {
            Schedule::Fixed(s) => s.created_ts,
            Schedule::Intelligent(s) => s.created_ts,
        }
    }

    pub fn created_date(&self) -> NaiveDate {
        match self {
            Schedule::Fixed(s) => s.created_date,
            Schedule::Intelligent(s) => s.created_date,
        }
    }

    pub fn descriptor(&self) -> ScheduleDescriptor {
        ScheduleDescriptor {
            kind: self.kind().whatami().to_string(),
            created_ts: self.created_ts(),
            created_date: self.created_date(),
            id: self.id(),
        }
    }

    /// `<yyyy>_<mm>_<dd>_<fixed|intel>_<id>.json`, dated by `created_date`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.json",
            self.created_date().format("%Y_%m_%d"),
            self.kind().file_token(),
            self.id()
        )
    }

    /// The day bucket that applies on `date`, if any.
    pub fn day_plan(&self, date: NaiveDate) -> Option<(DayKey, &[ScheduledEvent])> {
        match self {
            Schedule::Fixed(s) => {
                let key = DayKey::from_weekday(date.weekday());
                s.day(key).map(|list| (key, list.events()))
            }
            Schedule::Intelligent(s) => s
                .days()
                .into_iter()
                .find(|(_, day)| day.date == date)
                .map(|(key, day)| (key, day.events.events())),
        }
    }

    /// Every day bucket with its events, for validation and display.
    pub fn buckets(&self) -> Vec<(DayKey, &EventList)> {
        match self {
            Schedule::Fixed(s) => DayKey::WEEKDAYS
                .iter()
                .filter_map(|key| s.day(*key).map(|list| (*key, list)))
                .collect(),
            Schedule::Intelligent(s) => s
                .days()
                .into_iter()
                .map(|(key, day)| (key, &day.events))
                .collect(),
        }
    }

    /// An intelligent schedule stops applying after 23:59 on its third day;
    /// fixed schedules never do.
    pub fn is_expired_at(&self, now: NaiveDateTime) -> bool {
        match self {
            Schedule::Fixed(_) => false,
            Schedule::Intelligent(s) => s.expires_at() < now,
        }
    }
}

/// Parsed `<yyyy>_<mm>_<dd>_<fixed|intel>_<id>.json` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFileName {
    pub date: NaiveDate,
    pub kind: ScheduleKind,
    pub id: u32,
}

impl ScheduleFileName {
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let mut parts = stem.split('_');
        let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
        let kind = match parts.next()? {
            "fixed" => ScheduleKind::Fixed,
            "intel" => ScheduleKind::Intelligent,
            _ => return None,
        };
        let id = parts.next()?.parse().ok()?;
        if parts.next().is_some() || year.len() != 4 || month.len() != 2 || day.len() != 2 {
            return None;
        }
        let date =
            NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
        Some(Self { date, kind, id })
    }
}
