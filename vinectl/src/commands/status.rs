//! Status command: the whole picture for an operator.

use anyhow::Result;
use chrono::Local;
use colored::Colorize;

use crate::config::Config;
use crate::fs::quarantine;
use crate::fs::{Record, WorkDir};
use crate::models::CheckpointName;
use crate::registry::ProcessRegistry;
use crate::schedule::{ScheduleEngine, Usability};
use crate::supervisor::shutdown;

/// Show schedule, registry, due event and outbox state
pub fn execute(config: &Config, work_dir: &WorkDir) -> Result<()> {
    let now = Local::now().naive_local();
    let engine = ScheduleEngine::new(work_dir);
    let registry = ProcessRegistry::new(work_dir);

    println!("{}", "Vineyard Irrigation Status".bold().blue());
    println!("{}", "=".repeat(50));

    println!("\n{}", "Schedule".bold());
    match engine.store().current()? {
        Record::Present(schedule) => {
            println!("  Type:     {}", schedule.kind());
            println!("  Id:       {}", schedule.id());
            println!("  Created:  {}", schedule.created_date());
        }
        Record::Corrupt(reason) => println!("  {} {reason}", "Corrupt:".red()),
        Record::Absent => println!("  {}", "none in force".yellow()),
    }
    let usability = engine.currently_usable(now);
    let label = match usability {
        Usability::Valid => usability.to_string().green(),
        Usability::Expired | Usability::Unknown => usability.to_string().red(),
    };
    println!("  Usable:   {label}");

    println!("\n{}", "Supervisors".bold());
    match registry.get()? {
        Some(map) => {
            for (pid, key) in map {
                let state = if registry.is_running(pid) {
                    "alive".green()
                } else {
                    "dead".red()
                };
                println!("  pid {pid} [{state}] {key}");
            }
        }
        None => println!("  {}", "none".dimmed()),
    }
    if shutdown::stop_requested(work_dir) {
        println!("  {}", "stop requested".yellow());
    }

    println!("\n{}", "Due now".bold());
    match engine.event_that_should_be_running(now)? {
        Some(plan) => println!(
            "  {} block {} {}-{}",
            plan.key,
            plan.block(),
            plan.start.format("%H:%M"),
            plan.end.format("%H:%M")
        ),
        None => println!("  {}", "nothing".dimmed()),
    }

    println!("\n{}", "Files".bold());
    let checkpoints = quarantine::list_files(&work_dir.in_progress_dir())?
        .iter()
        .filter_map(|p| p.file_name())
        .filter(|n| CheckpointName::parse(&n.to_string_lossy()).is_some_and(|c| !c.is_backup))
        .count();
    println!("  Checkpoints:   {checkpoints}");
    println!(
        "  Reports:       {}",
        quarantine::list_files(&work_dir.gals_disp_dir())?.len()
    );
    println!(
        "  Alarms:        {}",
        quarantine::list_files(&work_dir.alarms_dir())?.len()
    );
    println!(
        "  Orphans:       {}",
        quarantine::list_files(&work_dir.orphans_dir())?.len()
    );
    println!(
        "  Corrupt files: {}",
        quarantine::list_files(&work_dir.corrupt_dir())?.len()
    );

    println!("\n{}", "Hardware".bold());
    println!("  Backend:  {:?}", config.hardware);
    println!(
        "  Valves:   {}",
        config
            .valves
            .iter()
            .map(|(block, pin)| format!("{block}:{pin}"))
            .collect::<Vec<_>>()
            .join(" ")
    );

    println!();
    Ok(())
}
