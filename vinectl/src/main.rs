use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vinectl::commands::{recover, reset, schedule, status, stop, tick};
use vinectl::config::Config;
use vinectl::fs::WorkDir;

#[derive(Parser)]
#[command(name = "vinectl")]
#[command(about = "Vineyard block irrigation controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to $VINECTL_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data root
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, tidy, recover and reconcile; may run the due event
    Tick {
        /// Report the event that would start without starting it
        #[arg(long)]
        plan_only: bool,
    },

    /// Show schedule, running event and pending files
    Status,

    /// Stop the running event
    Stop,

    /// Kill supervisors, clear state and fall back to the default schedule
    Reset,

    /// Report orphaned pulse checkpoints
    Recover,

    /// Work with schedule documents on disk
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Check a schedule file without installing it
    Validate {
        /// Path to the schedule JSON
        file: PathBuf,
    },

    /// Validate a schedule file and put it in force
    Install {
        /// Path to the schedule JSON
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    config.validate().context("Invalid configuration")?;
    let work_dir = WorkDir::new(&config.root);

    init_logging(&work_dir);

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let result = match cli.command {
        Commands::Tick { plan_only } => tick::execute(&config, &work_dir, interrupt, plan_only),
        Commands::Status => status::execute(&config, &work_dir),
        Commands::Stop => stop::execute(&config, &work_dir),
        Commands::Reset => reset::execute(&config, &work_dir),
        Commands::Recover => recover::execute(&config, &work_dir),
        Commands::Schedule { command } => match command {
            ScheduleCommands::Validate { file } => schedule::validate(&config, &file),
            ScheduleCommands::Install { file } => schedule::install(&config, &work_dir, &file),
        },
    };

    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "command failed");
    }
    result
}

/// Log to a per-invocation file under `sys_logs`, or stderr when that
/// file cannot be created.
fn init_logging(work_dir: &WorkDir) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_name = format!("{}_vinectl.log", Local::now().format("%Y_%m_%d_%H_%M"));

    let log_file = work_dir
        .ensure_dir("sys_logs")
        .and_then(|dir| Ok(File::options().create(true).append(true).open(dir.join(file_name))?));

    match log_file {
        Ok(file) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
            .init(),
        Err(_) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}
