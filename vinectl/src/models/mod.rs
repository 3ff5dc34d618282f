pub mod checkpoint;
pub mod event;
pub mod phase;
pub mod report;
pub mod schedule;

pub use checkpoint::{Generation, PulseCheckpoint, Sample};
pub use event::{CheckpointName, EventKey, EventPlan};
pub use phase::EventPhase;
pub use report::{AlarmDirection, FaultAlarm, FlowAlarm, GallonsReport, ReportKind};
pub use schedule::{
    DayKey, EventList, HourMinute, Schedule, ScheduleDescriptor, ScheduleFileName, ScheduleKind,
    ScheduledEvent,
};
