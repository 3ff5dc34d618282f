//! Schedule subcommands: check or install a schedule document from disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

use crate::config::Config;
use crate::error::ScheduleError;
use crate::fs::WorkDir;
use crate::schedule::{load_schedule_file, validate as validate_schedule, ScheduleStore};

pub fn validate(config: &Config, path: &Path) -> Result<()> {
    let schedule = load_schedule_file(path)?;
    validate_schedule(&schedule, config)
        .with_context(|| format!("{} failed validation", path.display()))?;

    println!(
        "{} {} schedule {} is valid",
        "✓".green().bold(),
        schedule.kind(),
        schedule.id()
    );
    for (day, list) in schedule.buckets() {
        println!("  {day}: {} event(s)", list.events().len());
    }
    Ok(())
}

pub fn install(config: &Config, work_dir: &WorkDir, path: &Path) -> Result<()> {
    work_dir.ensure()?;
    let schedule = load_schedule_file(path)?;
    let store = ScheduleStore::new(work_dir);

    match store.install(&schedule, config) {
        Ok(installed) => {
            println!("{} In force: {}", "✓".green().bold(), installed.display());
            Ok(())
        }
        Err(e) if e.downcast_ref::<ScheduleError>() == Some(&ScheduleError::Identical) => {
            println!("{}", "Schedule is already in force".dimmed());
            Ok(())
        }
        Err(e) => Err(e),
    }
}
