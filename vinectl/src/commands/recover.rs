//! Recover command: send final reports for orphaned checkpoints.

use anyhow::Result;
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
    let controller = Controller::new(config.clone(), work_dir.clone(), valves);

    let swept = controller.recover(Local::now().naive_local())?;
    if swept.is_empty() {
        println!("{}", "No orphaned checkpoints".dimmed());
        return Ok(());
    }

    for (stem, outcome) in swept {
        match outcome {
            Outcome::Succeeded(report) => println!(
                "{} {stem}: {} gal, {} gpm",
                "✓".green().bold(),
                report.gallons,
                report.flow.unwrap_or_default()
            ),
            Outcome::Failed(reason) => {
                println!("{} {stem}: {reason} (moved to orphans)", "✗".red().bold())
            }
            Outcome::NotAttempted => {}
        }
    }
    Ok(())
}
