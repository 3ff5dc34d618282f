use anyhow::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::fs::WorkDir;
use crate::hardware::Hardware;
use crate::models::EventPlan;
use crate::supervisor::EventSupervisor;

/// Starts the supervisor for an event.
pub trait EventLauncher {
    fn launch(&mut self, plan: EventPlan) -> Result<()>;
}

/// Turns the calling process into the event's supervisor; `launch`
/// returns only when the event has ended.
pub struct InProcessLauncher {
    config: Config,
    work_dir: WorkDir,
    interrupt: Arc<AtomicBool>,
}

impl InProcessLauncher {
    pub fn new(config: Config, work_dir: WorkDir, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            config,
            work_dir,
            interrupt,
        }
    }
}

impl EventLauncher for InProcessLauncher {
    fn launch(&mut self, plan: EventPlan) -> Result<()> {
        let hardware = Hardware::from_config(&self.config);
        let summary = EventSupervisor::new(self.config.clone(), self.work_dir.clone(), plan, hardware)
            .with_interrupt(Arc::clone(&self.interrupt))
            .run()?;
        info!(
            reason = ?summary.reason,
            gallons = summary.gallons,
            flow = ?summary.flow,
            "supervisor finished"
        );
        Ok(())
    }
}

/// Remembers what it was asked to start, without starting anything.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Vec<EventPlan>,
}

impl EventLauncher for RecordingLauncher {
    fn launch(&mut self, plan: EventPlan) -> Result<()> {
        info!(key = %plan.key, "launch recorded");
        self.launched.push(plan);
        Ok(())
    }
}
