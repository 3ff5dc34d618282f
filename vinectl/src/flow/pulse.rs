//! Bounded hand-off from pulse producers to the supervisor loop.
//!
//! Producers never block: a full channel drops the pulse and counts it.
//! The receiving side owns the canonical counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// Unix seconds at capture
    pub ts: i64,
}

impl Pulse {
    pub fn now() -> Self {
        Self {
            ts: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Clone)]
pub struct PulseSender {
    tx: SyncSender<Pulse>,
    dropped: Arc<AtomicU64>,
}

impl PulseSender {
    /// Enqueue without blocking. Returns false if the pulse was not
    /// accepted.
    pub fn send(&self, pulse: Pulse) -> bool {
        match self.tx.try_send(pulse) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct PulseReceiver {
    rx: Receiver<Pulse>,
    dropped: Arc<AtomicU64>,
}

/// What a wait on the channel produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Pulse(Pulse),
    Deadline,
    /// Every sender is gone
    Closed,
}

impl PulseReceiver {
    /// Wait for the next pulse, giving up at `deadline`.
    pub fn recv_until(&self, deadline: Instant) -> Received {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(timeout) {
            Ok(pulse) => Received::Pulse(pulse),
            Err(RecvTimeoutError::Timeout) => Received::Deadline,
            Err(RecvTimeoutError::Disconnected) => Received::Closed,
        }
    }

    /// Everything already queued.
    pub fn drain(&self) -> Vec<Pulse> {
        self.rx.try_iter().collect()
    }

    /// Pulses lost to a full channel so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn pulse_channel(capacity: usize) -> (PulseSender, PulseReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        PulseSender {
            tx,
            dropped: Arc::clone(&dropped),
        },
        PulseReceiver { rx, dropped },
    )
}
