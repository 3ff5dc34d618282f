use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use super::{PulseHandle, PulseSource, ValveBank};
use crate::error::HardwareError;
use crate::flow::{Pulse, PulseSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveAction {
    CloseAll,
    Open(String),
}

/// Valve bank that only logs and records what it was asked to do.
pub struct DryRunValveBank {
    blocks: BTreeSet<String>,
    actions: Arc<Mutex<Vec<ValveAction>>>,
}

impl DryRunValveBank {
    pub fn new(blocks: impl IntoIterator<Item = String>) -> Self {
        Self {
            blocks: blocks.into_iter().collect(),
            actions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of the recorded actions, readable after the bank has
    /// been moved into a supervisor.
    pub fn actions_handle(&self) -> Arc<Mutex<Vec<ValveAction>>> {
        Arc::clone(&self.actions)
    }

    fn push(&self, action: ValveAction) {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(action);
    }
}

impl ValveBank for DryRunValveBank {
    fn close_all(&mut self) -> Result<(), HardwareError> {
        info!("dry run: closing all valves");
        self.push(ValveAction::CloseAll);
        Ok(())
    }

    fn open(&mut self, block: &str) -> Result<(), HardwareError> {
        if !self.blocks.contains(block) {
            return Err(HardwareError::UnknownBlock(block.to_string()));
        }
        info!(block, "dry run: opening valve");
        self.push(ValveAction::Open(block.to_string()));
        Ok(())
    }
}

/// No flow sensor.
pub struct NoPulses;

impl PulseSource for NoPulses {
    fn start(&mut self, _sender: PulseSender) -> Result<PulseHandle> {
        Ok(PulseHandle::idle())
    }
}

/// Delivers a fixed list of pulses as soon as it is started.
pub struct ScriptedPulses {
    pulses: Vec<Pulse>,
}

impl ScriptedPulses {
    pub fn new(pulses: Vec<Pulse>) -> Self {
        Self { pulses }
    }
}

impl PulseSource for ScriptedPulses {
    fn start(&mut self, sender: PulseSender) -> Result<PulseHandle> {
        for pulse in self.pulses.drain(..) {
            sender.send(pulse);
        }
        Ok(PulseHandle::idle())
    }
}

/// Steady synthetic flow at a fixed gallons-per-minute.
pub struct SimulatedFlow {
    interval: Option<Duration>,
}

impl SimulatedFlow {
    pub fn new(gpm: u32, gallons_per_pulse: u32) -> Self {
        let pulses_per_minute = gpm / gallons_per_pulse.max(1);
        let interval = (pulses_per_minute > 0)
            .then(|| Duration::from_secs(60) / pulses_per_minute);
        Self { interval }
    }
}

impl PulseSource for SimulatedFlow {
    fn start(&mut self, sender: PulseSender) -> Result<PulseHandle> {
        let Some(interval) = self.interval else {
            return Ok(PulseHandle::idle());
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("simulated-flow".to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while !stop_flag.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now >= next {
                        sender.send(Pulse::now());
                        next += interval;
                        continue;
                    }
                    thread::sleep((next - now).min(Duration::from_millis(100)));
                }
            })?;

        Ok(PulseHandle::new(stop, Some(thread)))
    }
}
