//! Reset command: stop everything and install the default schedule.

use anyhow::{bail, Result};
use chrono::Local;
use colored::Colorize;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::Outcome;
use crate::fs::WorkDir;
use crate::hardware::Hardware;

pub fn execute(config: &Config, work_dir: &WorkDir) -> Result<()> {
    let valves = Hardware::from_config(config).valves;
    let mut controller = Controller::new(config.clone(), work_dir.clone(), valves);

    match controller.reset(Local::now().naive_local()) {
        Outcome::Succeeded(report) => {
            println!("{} Software reset complete", "✓".green().bold());
            if !report.killed.is_empty() {
                println!("  Stopped supervisor(s): {:?}", report.killed);
            }
            for path in &report.preserved {
                println!("  Preserved {}", path.display());
            }
            if let Some(path) = &report.schedule {
                println!("  In force: {}", path.display());
            }
            Ok(())
        }
        Outcome::Failed(reason) => bail!("Software reset incomplete: {reason}"),
        Outcome::NotAttempted => Ok(()),
    }
}
