//! Stop command: cooperative stop of the running event, killing it if it
//! does not respond in time.

use anyhow::{bail, Result};
use chrono::Local;
use colored::Colorize;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::Outcome;
use crate::fs::WorkDir;
use crate::hardware::Hardware;

pub fn execute(config: &Config, work_dir: &WorkDir) -> Result<()> {
    work_dir.ensure()?;
    let valves = Hardware::from_config(config).valves;
    let mut controller = Controller::new(config.clone(), work_dir.clone(), valves);

    match controller.stop_current_event(Local::now().naive_local()) {
        Outcome::NotAttempted => println!("{}", "No irrigation event is running".dimmed()),
        Outcome::Succeeded(()) => println!("{} Irrigation event stopped", "✓".green().bold()),
        Outcome::Failed(reason) => bail!("Could not stop irrigation event: {reason}"),
    }
    Ok(())
}
