//! Error types and the three-way [`Outcome`] used across the controller.
//!
//! Typed errors cover the failure classes callers branch on. Glue code uses
//! `anyhow` and adds context as it propagates; callers that care about a
//! specific class downcast to one of the enums below.

use std::fmt;
use thiserror::Error;

/// Result of an operation that may legitimately not run at all.
///
/// `NotAttempted` means there was nothing to do (e.g. no registry exists),
/// which callers must not confuse with a failure.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    NotAttempted,
    Failed(String),
    Succeeded(T),
}

impl<T> Outcome<T> {
    pub fn failed(reason: impl fmt::Display) -> Self {
        Outcome::Failed(reason.to_string())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    /// `NotAttempted` and `Succeeded` both leave the system in a good state.
    pub fn is_ok_or_skipped(&self) -> bool {
        !self.is_failed()
    }

    pub fn succeeded(self) -> Option<T> {
        match self {
            Outcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::NotAttempted => Outcome::NotAttempted,
            Outcome::Failed(reason) => Outcome::Failed(reason),
            Outcome::Succeeded(value) => Outcome::Succeeded(f(value)),
        }
    }
}

impl<T> From<anyhow::Result<T>> for Outcome<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Succeeded(value),
            Err(e) => Outcome::Failed(format!("{e:#}")),
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NotAttempted => write!(f, "not attempted"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
            Outcome::Succeeded(value) => write!(f, "succeeded: {value:?}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("process {pid} already has a registry entry")]
    AlreadyRegistered { pid: u32 },

    #[error("registry record is corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("could not terminate process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule document is malformed: {0}")]
    Malformed(String),

    #[error("event {sequence} on {day}: {reason}")]
    InvalidEvent {
        day: String,
        sequence: u32,
        reason: String,
    },

    #[error("duplicate sequence {sequence} on {day}")]
    DuplicateSequence { day: String, sequence: u32 },

    #[error("schedule is identical to the one in force")]
    Identical,

    #[error("schedule directory holds {fixed} fixed schedules")]
    ConflictingFixed { fixed: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowError {
    #[error("no pulse data recorded")]
    NoData,

    #[error("pulse checkpoint is invalid: {0}")]
    InvalidCheckpoint(String),
}

#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("unknown block '{0}'")]
    UnknownBlock(String),

    #[error("gpio {pin}: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
}

impl HardwareError {
    pub fn gpio(pin: u32, source: std::io::Error) -> Self {
        HardwareError::Gpio { pin, source }
    }
}
