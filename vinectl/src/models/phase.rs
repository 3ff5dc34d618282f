use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle of one supervised irrigation event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Starting,
    Running,
    StoppingGraceful,
    StoppingForced,
    Ended,
}

impl std::fmt::Display for EventPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPhase::Starting => write!(f, "Starting"),
            EventPhase::Running => write!(f, "Running"),
            EventPhase::StoppingGraceful => write!(f, "StoppingGraceful"),
            EventPhase::StoppingForced => write!(f, "StoppingForced"),
            EventPhase::Ended => write!(f, "Ended"),
        }
    }
}

impl EventPhase {
    /// Check if transitioning from the current phase to `next` is valid.
    ///
    /// Valid transitions:
    /// - `Starting` -> `Running` | `StoppingGraceful` (startup failed after valves were touched)
    /// - `Running` -> `StoppingGraceful` | `StoppingForced`
    /// - `StoppingGraceful` | `StoppingForced` -> `Ended`
    ///
    /// `StoppingForced` is entered by the process that kills this one; the
    /// killed process never observes it.
    pub fn can_transition_to(&self, next: &EventPhase) -> bool {
        if self == next {
            return true;
        }

        match self {
            EventPhase::Starting => {
                matches!(next, EventPhase::Running | EventPhase::StoppingGraceful)
            }
            EventPhase::Running => matches!(
                next,
                EventPhase::StoppingGraceful | EventPhase::StoppingForced
            ),
            EventPhase::StoppingGraceful | EventPhase::StoppingForced => {
                matches!(next, EventPhase::Ended)
            }
            EventPhase::Ended => false,
        }
    }

    pub fn try_transition(&self, next: EventPhase) -> Result<EventPhase> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            bail!("Invalid event phase transition: {self} -> {next}")
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPhase::Ended)
    }
}
