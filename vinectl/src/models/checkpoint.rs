use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::event::EventKey;
use super::schedule::DayKey;

pub const CHECKPOINT_WHATAMI: &str = "pulse_count";

/// One `(timestamp, cumulative count)` observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Unix seconds
    pub ts: i64,
    pub count: u64,
}

/// Pulses counted by one OS process. Counts restart at zero per generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub pid: u32,
    pub samples: Vec<Sample>,
}

impl Generation {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            samples: Vec::new(),
        }
    }

    pub fn max_count(&self) -> u64 {
        self.samples.iter().map(|s| s.count).max().unwrap_or(0)
    }

    pub fn last_count(&self) -> u64 {
        self.samples.last().map(|s| s.count).unwrap_or(0)
    }
}

/// Persisted pulse history of one irrigation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCheckpoint", into = "RawCheckpoint")]
pub struct PulseCheckpoint {
    pub schedule_id: u32,
    pub date: NaiveDate,
    pub day: DayKey,
    pub sequence: u32,
    pub block: String,
    pub generations: Vec<Generation>,
}

impl PulseCheckpoint {
    pub fn new(key: &EventKey, block: &str) -> Self {
        Self {
            schedule_id: key.schedule_id,
            date: key.date,
            day: key.day,
            sequence: key.sequence,
            block: block.to_string(),
            generations: Vec::new(),
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            date: self.date,
            day: self.day,
            sequence: self.sequence,
            schedule_id: self.schedule_id,
        }
    }

    /// Start counting for a new process. Always appends, even if `pid` was
    /// seen before, since a reused pid is still a fresh count from zero.
    pub fn begin_generation(&mut self, pid: u32) {
        self.generations.push(Generation::new(pid));
    }

    pub fn current_generation(&self) -> Option<&Generation> {
        self.generations.last()
    }

    pub fn current_generation_mut(&mut self) -> Option<&mut Generation> {
        self.generations.last_mut()
    }

    pub fn sample_count(&self) -> usize {
        self.generations.iter().map(|g| g.samples.len()).sum()
    }
}

/// Wire form: `{"whatami":"pulse_count", ..., "pulses":[{"<pid>":[{"<ts>":count}]}]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCheckpoint {
    whatami: String,
    sched_id: u32,
    date: NaiveDate,
    day: DayKey,
    sequence: u32,
    block: String,
    pulses: Vec<BTreeMap<String, Vec<BTreeMap<String, u64>>>>,
}

fn single_entry<V>(map: BTreeMap<String, V>, what: &str) -> Result<(String, V), String> {
    if map.len() != 1 {
        return Err(format!("{what} entry must hold exactly one key, found {}", map.len()));
    }
    map.into_iter()
        .next()
        .ok_or_else(|| format!("{what} entry is empty"))
}

impl TryFrom<RawCheckpoint> for PulseCheckpoint {
    type Error = String;

    fn try_from(raw: RawCheckpoint) -> Result<Self, Self::Error> {
        if raw.whatami != CHECKPOINT_WHATAMI {
            return Err(format!("whatami is '{}', not '{CHECKPOINT_WHATAMI}'", raw.whatami));
        }

        let mut generations = Vec::with_capacity(raw.pulses.len());
        for generation in raw.pulses {
            let (pid, raw_samples) = single_entry(generation, "generation")?;
            let pid: u32 = pid
                .parse()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| format!("invalid process id '{pid}'"))?;

            let mut samples = Vec::with_capacity(raw_samples.len());
            for sample in raw_samples {
                let (ts, count) = single_entry(sample, "sample")?;
                let ts: i64 = ts
                    .parse()
                    .ok()
                    .filter(|t| *t > 0)
                    .ok_or_else(|| format!("invalid timestamp '{ts}'"))?;
                if count == 0 {
                    return Err(format!("zero pulse count at {ts}"));
                }
                samples.push(Sample { ts, count });
            }

            generations.push(Generation { pid, samples });
        }

        Ok(Self {
            schedule_id: raw.sched_id,
            date: raw.date,
            day: raw.day,
            sequence: raw.sequence,
            block: raw.block,
            generations,
        })
    }
}

impl From<PulseCheckpoint> for RawCheckpoint {
    fn from(checkpoint: PulseCheckpoint) -> Self {
        let pulses = checkpoint
            .generations
            .into_iter()
            .map(|g| {
                let samples = g
                    .samples
                    .into_iter()
                    .map(|s| BTreeMap::from([(s.ts.to_string(), s.count)]))
                    .collect();
                BTreeMap::from([(g.pid.to_string(), samples)])
            })
            .collect();

        Self {
            whatami: CHECKPOINT_WHATAMI.to_string(),
            sched_id: checkpoint.schedule_id,
            date: checkpoint.date,
            day: checkpoint.day,
            sequence: checkpoint.sequence,
            block: checkpoint.block,
            pulses,
        }
    }
}
