//! Water-flow accounting: pulse capture, checkpoints and the arithmetic over
//! them.
//!
//! All rates are whole gallons per minute. Totals sum each generation's
//! maximum cumulative count, because every generation restarts at zero.

pub mod counter;
pub mod pulse;

pub use counter::{load_checkpoint, FlowCounter};
pub use pulse::{pulse_channel, Pulse, PulseReceiver, PulseSender};

use crate::error::FlowError;
use crate::models::{AlarmDirection, Generation, Sample, ScheduledEvent};

/// Sum of per-generation maxima.
pub fn total_pulses(generations: &[Generation]) -> u64 {
    generations.iter().map(Generation::max_count).sum()
}

pub fn total_gallons(generations: &[Generation], gallons_per_pulse: u32) -> u64 {
    total_pulses(generations) * u64::from(gallons_per_pulse)
}

/// Rate between two samples of the same generation.
///
/// Elapsed time is truncated to whole minutes; an interval shorter than a
/// minute has rate 0.
pub fn interval_rate(prev: Sample, next: Sample, gallons_per_pulse: u32) -> u32 {
    let elapsed_mins = (next.ts - prev.ts) / 60;
    if elapsed_mins <= 0 {
        return 0;
    }
    let gallons = next.count.saturating_sub(prev.count) * u64::from(gallons_per_pulse);
    u32::try_from(gallons / elapsed_mins.unsigned_abs()).unwrap_or(u32::MAX)
}

/// Mean of every consecutive-sample rate across all generations.
///
/// No samples at all is [`FlowError::NoData`]; samples without any interval
/// between them give 0.
pub fn average_flow_rate(generations: &[Generation], gallons_per_pulse: u32) -> Result<u32, FlowError> {
    if generations.iter().all(|g| g.samples.is_empty()) {
        return Err(FlowError::NoData);
    }

    let rates: Vec<u64> = generations
        .iter()
        .flat_map(|g| g.samples.windows(2))
        .map(|pair| u64::from(interval_rate(pair[0], pair[1], gallons_per_pulse)))
        .collect();

    if rates.is_empty() {
        return Ok(0);
    }
    let mean = rates.iter().sum::<u64>() / rates.len() as u64;
    Ok(u32::try_from(mean).unwrap_or(u32::MAX))
}

/// Rate of the newest stretch of one generation lasting at least
/// `window_secs`, by the same whole-minute arithmetic as [`interval_rate`].
///
/// Uses the newest sample and the latest sample at least `window_secs`
/// older than it, so with slow pulses this is just the last two samples.
/// `None` until the generation spans a full window.
pub fn trailing_rate(generation: &Generation, window_secs: i64, gallons_per_pulse: u32) -> Option<u32> {
    let newest = *generation.samples.last()?;
    let window_secs = window_secs.max(60);
    let base = generation
        .samples
        .iter()
        .rev()
        .skip(1)
        .find(|s| newest.ts - s.ts >= window_secs)?;

    Some(interval_rate(*base, newest, gallons_per_pulse))
}

/// Compare an observed rate to the event's tolerance band.
///
/// Returns the direction and whole-percent deviation when the rate is
/// outside `[exp - exp*under%, exp + exp*over%]`.
pub fn check_flow(rate: u32, event: &ScheduledEvent) -> Option<(AlarmDirection, u32)> {
    let expected = u64::from(event.exp_flow);
    if expected == 0 {
        return None;
    }
    let rate = u64::from(rate);
    let upper = expected + expected * u64::from(event.over_flow_tol) / 100;
    let lower = expected.saturating_sub(expected * u64::from(event.under_flow_tol) / 100);

    let (direction, deviation) = if rate > upper {
        (AlarmDirection::Over, rate - expected)
    } else if rate < lower {
        (AlarmDirection::Under, expected - rate)
    } else {
        return None;
    };

    let percent = u32::try_from(deviation * 100 / expected).unwrap_or(u32::MAX);
    Some((direction, percent))
}
