use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE: &str = "process_reg.json";
pub const REGISTRY_LOCK_FILE: &str = "registry.lock";
pub const STOP_SEMAPHORE_FILE: &str = "stop_irr.json";

const SUBDIRS: [&str; 10] = [
    "control/irr_sched/current",
    "control/irr_sched/new",
    "control/process_reg",
    "control/irr_event",
    "control/irr_event/in_progress",
    "comms/gals_disp",
    "comms/alarms",
    "comms/orphans",
    "comms/corrupt_files",
    "sys_logs",
];

/// On-disk layout of one controller deployment.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create any missing directory of the layout.
    pub fn ensure(&self) -> Result<()> {
        for subdir in &SUBDIRS {
            self.ensure_dir(subdir)?;
        }
        Ok(())
    }

    /// Ensure a subdirectory exists, creating it if needed
    ///
    /// # Arguments
    /// * `name` - The subdirectory path relative to the root
    ///
    /// # Returns
    /// The full path to the directory
    pub fn ensure_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {} directory", dir.display()))?;
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schedule_current_dir(&self) -> PathBuf {
        self.root.join("control/irr_sched/current")
    }

    pub fn schedule_new_dir(&self) -> PathBuf {
        self.root.join("control/irr_sched/new")
    }

    pub fn process_reg_dir(&self) -> PathBuf {
        self.root.join("control/process_reg")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.process_reg_dir().join(REGISTRY_FILE)
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.process_reg_dir().join(REGISTRY_LOCK_FILE)
    }

    pub fn irr_event_dir(&self) -> PathBuf {
        self.root.join("control/irr_event")
    }

    /// Cooperative-shutdown semaphore polled by a running supervisor.
    pub fn stop_semaphore_path(&self) -> PathBuf {
        self.irr_event_dir().join(STOP_SEMAPHORE_FILE)
    }

    /// Pulse checkpoints of events in flight.
    pub fn in_progress_dir(&self) -> PathBuf {
        self.irr_event_dir().join("in_progress")
    }

    pub fn gals_disp_dir(&self) -> PathBuf {
        self.root.join("comms/gals_disp")
    }

    pub fn alarms_dir(&self) -> PathBuf {
        self.root.join("comms/alarms")
    }

    pub fn orphans_dir(&self) -> PathBuf {
        self.root.join("comms/orphans")
    }

    pub fn corrupt_dir(&self) -> PathBuf {
        self.root.join("comms/corrupt_files")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("sys_logs")
    }
}
