//! Valve relays and the flow sensor.
//!
//! The supervisor talks to hardware only through [`ValveBank`] and
//! [`PulseSource`], so the same event logic runs against GPIO, a dry run,
//! or a simulated flow.

pub mod sim;
pub mod sysfs;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::{Config, HardwareBackend};
use crate::error::HardwareError;
use crate::flow::PulseSender;

pub use sim::{DryRunValveBank, NoPulses, ScriptedPulses, SimulatedFlow, ValveAction};
pub use sysfs::{SysfsPulseInput, SysfsValveBank};

pub trait ValveBank: Send {
    fn close_all(&mut self) -> Result<(), HardwareError>;
    fn open(&mut self, block: &str) -> Result<(), HardwareError>;
}

pub trait PulseSource: Send {
    /// Begin delivering pulses into `sender` until the handle is stopped.
    fn start(&mut self, sender: PulseSender) -> Result<PulseHandle>;
}

/// Running pulse producer; stops and joins its thread on drop.
pub struct PulseHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PulseHandle {
    pub fn new(stop: Arc<AtomicBool>, thread: Option<JoinHandle<()>>) -> Self {
        Self { stop, thread }
    }

    /// Handle for a source that has no thread.
    pub fn idle() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), None)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("pulse input thread panicked");
            }
        }
    }
}

impl Drop for PulseHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Hardware {
    pub valves: Box<dyn ValveBank>,
    pub pulses: Box<dyn PulseSource>,
}

impl Hardware {
    pub fn from_config(config: &Config) -> Self {
        match config.hardware {
            HardwareBackend::Sysfs => Self {
                valves: Box::new(SysfsValveBank::new(config.valves.clone())),
                pulses: Box::new(SysfsPulseInput::new(
                    config.flow_sensor_pin,
                    config.pulse_debounce(),
                )),
            },
            HardwareBackend::DryRun => Self {
                valves: Box::new(DryRunValveBank::new(config.valves.keys().cloned())),
                pulses: Box::new(NoPulses),
            },
            HardwareBackend::Simulated => Self {
                valves: Box::new(DryRunValveBank::new(config.valves.keys().cloned())),
                pulses: Box::new(SimulatedFlow::new(
                    config.simulated_gpm,
                    config.gallons_per_pulse,
                )),
            },
        }
    }
}
