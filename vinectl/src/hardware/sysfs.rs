//! Linux GPIO through the sysfs interface.
//!
//! Valve relays are outputs driven high to open; the flow sensor is an
//! input with edge interrupts delivered as `POLLPRI` on its value file.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::{PulseHandle, PulseSource, ValveBank};
use crate::error::HardwareError;
use crate::flow::{Pulse, PulseSender};

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

const POLL_TIMEOUT_MS: i32 = 500;

fn pin_dir(root: &Path, pin: u32) -> PathBuf {
    root.join(format!("gpio{pin}"))
}

/// Export `pin` unless the kernel already has it.
fn export(root: &Path, pin: u32) -> Result<(), HardwareError> {
    if pin_dir(root, pin).exists() {
        return Ok(());
    }
    fs::write(root.join("export"), pin.to_string()).map_err(|e| HardwareError::gpio(pin, e))?;
    // udev needs a moment to fix up permissions on the new directory
    thread::sleep(Duration::from_millis(100));
    Ok(())
}

fn write_attr(root: &Path, pin: u32, attr: &str, value: &str) -> Result<(), HardwareError> {
    fs::write(pin_dir(root, pin).join(attr), value).map_err(|e| HardwareError::gpio(pin, e))
}

pub struct SysfsValveBank {
    root: PathBuf,
    valves: BTreeMap<String, u32>,
    configured: bool,
}

impl SysfsValveBank {
    pub fn new(valves: BTreeMap<String, u32>) -> Self {
        Self::with_root(SYSFS_GPIO_ROOT, valves)
    }

    pub fn with_root(root: impl Into<PathBuf>, valves: BTreeMap<String, u32>) -> Self {
        Self {
            root: root.into(),
            valves,
            configured: false,
        }
    }

    fn configure(&mut self) -> Result<(), HardwareError> {
        if self.configured {
            return Ok(());
        }
        for pin in self.valves.values() {
            export(&self.root, *pin)?;
            write_attr(&self.root, *pin, "direction", "out")?;
        }
        self.configured = true;
        Ok(())
    }
}

impl ValveBank for SysfsValveBank {
    fn close_all(&mut self) -> Result<(), HardwareError> {
        self.configure()?;
        for (block, pin) in &self.valves {
            write_attr(&self.root, *pin, "value", "0")?;
            debug!(block = %block, pin, "valve closed");
        }
        Ok(())
    }

    fn open(&mut self, block: &str) -> Result<(), HardwareError> {
        let pin = *self
            .valves
            .get(block)
            .ok_or_else(|| HardwareError::UnknownBlock(block.to_string()))?;
        self.configure()?;
        write_attr(&self.root, pin, "value", "1")?;
        info!(block, pin, "valve opened");
        Ok(())
    }
}

/// Edge-triggered flow sensor input.
pub struct SysfsPulseInput {
    root: PathBuf,
    pin: u32,
    debounce: Duration,
}

impl SysfsPulseInput {
    pub fn new(pin: u32, debounce: Duration) -> Self {
        Self {
            root: PathBuf::from(SYSFS_GPIO_ROOT),
            pin,
            debounce,
        }
    }

    fn open_value(&self) -> Result<File> {
        export(&self.root, self.pin)?;
        write_attr(&self.root, self.pin, "direction", "in")?;
        write_attr(&self.root, self.pin, "edge", "both")?;

        let path = pin_dir(&self.root, self.pin).join("value");
        File::open(&path).with_context(|| format!("Failed to open {}", path.display()))
    }
}

/// Consume the current value so the next edge raises `POLLPRI` again.
fn rearm(file: &mut File) -> std::io::Result<()> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(0))?;
    let _ = file.read(&mut buf)?;
    Ok(())
}

/// Wait for an edge. Returns `Ok(false)` on timeout.
fn wait_for_edge(file: &File) -> std::io::Result<bool> {
    let mut fds = [libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    }];

    // SAFETY: `fds` is a valid array of one pollfd for the duration of the
    // call, and the fd stays open because `file` is borrowed.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), 1, POLL_TIMEOUT_MS) };

    if ready < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0 && fds[0].revents & libc::POLLPRI != 0)
}

impl PulseSource for SysfsPulseInput {
    fn start(&mut self, sender: PulseSender) -> Result<PulseHandle> {
        let mut file = self.open_value()?;
        rearm(&mut file).map_err(|e| HardwareError::gpio(self.pin, e))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let pin = self.pin;
        let debounce = self.debounce;

        let thread = thread::Builder::new()
            .name(format!("flow-gpio{pin}"))
            .spawn(move || {
                let mut last_edge: Option<Instant> = None;
                while !stop_flag.load(Ordering::SeqCst) {
                    match wait_for_edge(&file) {
                        Ok(false) => continue,
                        Ok(true) => {}
                        Err(e) => {
                            error!(pin, error = %e, "flow sensor poll failed");
                            break;
                        }
                    }
                    if let Err(e) = rearm(&mut file) {
                        error!(pin, error = %e, "flow sensor read failed");
                        break;
                    }

                    let now = Instant::now();
                    if last_edge.is_some_and(|prev| now.duration_since(prev) < debounce) {
                        continue;
                    }
                    last_edge = Some(now);
                    sender.send(Pulse::now());
                }
            })?;

        info!(pin, "flow sensor input started");
        Ok(PulseHandle::new(stop, Some(thread)))
    }
}
