//! Cooperative shutdown through the stop semaphore file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::fs::durable;
use crate::fs::WorkDir;

pub const STOP_ACTION: &str = "stop-an-irrigation-event";

#[derive(Debug, Serialize, Deserialize)]
struct StopRequest {
    action: String,
}

/// Ask whichever supervisor is running to stop at its next check.
pub fn request_stop(work_dir: &WorkDir) -> Result<PathBuf> {
    let path = work_dir.stop_semaphore_path();
    durable::write(
        &path,
        &StopRequest {
            action: STOP_ACTION.to_string(),
        },
    )?;
    Ok(path)
}

/// Presence alone is the signal; a damaged semaphore still means stop.
pub fn stop_requested(work_dir: &WorkDir) -> bool {
    work_dir.stop_semaphore_path().exists()
}

/// Returns whether a semaphore was there.
pub fn clear_stop_request(work_dir: &WorkDir) -> Result<bool> {
    durable::remove_if_exists(&work_dir.stop_semaphore_path())
}

/// Stop conditions a running supervisor polls.
#[derive(Clone)]
pub struct StopSignals {
    work_dir: WorkDir,
    interrupt: Arc<AtomicBool>,
}

/// Why a supervisor left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Scheduled duration elapsed
    Completed,
    /// Stop semaphore observed
    StopRequested,
    /// Operator interrupt (Ctrl-C)
    Interrupted,
}

impl StopSignals {
    pub fn new(work_dir: WorkDir, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            work_dir,
            interrupt,
        }
    }

    pub fn check(&self) -> Option<StopReason> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Some(StopReason::Interrupted);
        }
        if stop_requested(&self.work_dir) {
            return Some(StopReason::StopRequested);
        }
        None
    }
}
