//! Tick command: one periodic controller run.
//! Usage: vinectl tick [--plan-only]

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::Config;
use crate::controller::{Controller, EventLauncher, InProcessLauncher, RecordingLauncher};
use crate::error::Outcome;
use crate::fs::WorkDir;
use crate::hardware::Hardware;
use crate::schedule::{Decision, HttpScheduleSource};

/// Execute the tick command
///
/// # Arguments
/// * `interrupt` - Raised on Ctrl-C; a supervisor started by this tick stops gracefully
/// * `plan_only` - Report what would be started instead of starting it
pub fn execute(
    config: &Config,
    work_dir: &WorkDir,
    interrupt: Arc<AtomicBool>,
    plan_only: bool,
) -> Result<()> {
    let valves = Hardware::from_config(config).valves;
    let mut controller = Controller::new(config.clone(), work_dir.clone(), valves);
    if let Some(source) = HttpScheduleSource::from_config(config)? {
        controller = controller.with_source(Box::new(source));
    }

    let mut recording = RecordingLauncher::default();
    let mut in_process = InProcessLauncher::new(config.clone(), work_dir.clone(), interrupt);
    let launcher: &mut dyn EventLauncher = if plan_only {
        &mut recording
    } else {
        &mut in_process
    };

    let report = controller.tick(Local::now().naive_local(), launcher)?;

    match &report.fetched {
        Outcome::Succeeded(Some(path)) => {
            println!("{} installed {}", "✓".green().bold(), path.display())
        }
        Outcome::Failed(reason) => println!("{} schedule fetch: {reason}", "✗".red().bold()),
        _ => {}
    }
    if report.aged_out > 0 {
        println!("  {} undelivered file(s) moved to orphans", report.aged_out);
    }
    for (stem, outcome) in &report.swept {
        println!("  orphan {stem}: {outcome}");
    }

    match &report.decision {
        Decision::Idle => println!("{}", "Idle".dimmed()),
        Decision::KeepRunning { pid, key } => println!("Running: {key} (pid {pid})"),
        Decision::Stop { key, .. } => println!("{} {key}", "Stopped".yellow()),
        Decision::Start(plan) if plan_only => {
            println!("{} {} block {} until {}", "Would start".cyan(), plan.key, plan.block(), plan.end)
        }
        Decision::Start(plan) => println!("{} {}", "Finished".green(), plan.key),
        Decision::Replace { key, start, .. } => {
            println!("{} {key} {} {}", "Replaced".yellow(), "→".dimmed(), start.key)
        }
        Decision::Reset(reason) => println!("{} {reason}", "Reset:".red().bold()),
    }

    Ok(())
}
