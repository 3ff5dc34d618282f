//! Deployment configuration.
//!
//! One `Config` value is loaded per invocation and handed to every component
//! that needs it; nothing reads configuration from globals.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "VINECTL_CONFIG";
pub const ROOT_ENV: &str = "VINECTL_ROOT";

const MIN_STOP_POLL: Duration = Duration::from_millis(100);
const MAX_STOP_POLL: Duration = Duration::from_secs(1);

/// Which valve/flow-sensor backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareBackend {
    /// Linux GPIO sysfs (production board)
    Sysfs,
    /// Log valve actions, no flow input
    DryRun,
    /// Log valve actions, synthesize pulses at `simulated_gpm`
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root: PathBuf,
    pub schedule_endpoint: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Block letter to valve relay GPIO pin
    pub valves: BTreeMap<String, u32>,
    pub flow_sensor_pin: u32,
    pub gallons_per_pulse: u32,
    pub checkpoint_interval_secs: u64,
    pub stop_wait_cycles: u32,
    pub stop_wait_secs: u64,
    pub report_max_age_days: i64,
    pub max_event_hours: u32,
    pub pulse_debounce_ms: u64,
    pub pulse_channel_capacity: usize,
    pub flow_check_window_secs: i64,
    pub hardware: HardwareBackend,
    pub simulated_gpm: u32,
}

impl Default for Config {
    fn default() -> Self {
        let valves = [
            ("a", 7),
            ("b", 8),
            ("c", 12),
            ("d", 16),
            ("e", 18),
            ("f", 23),
            ("g", 24),
        ]
        .into_iter()
        .map(|(block, pin)| (block.to_string(), pin))
        .collect();

        Self {
            root: PathBuf::from("/home/pi/lonesome"),
            schedule_endpoint: None,
            api_token: None,
            request_timeout_secs: 30,
            valves,
            flow_sensor_pin: 17,
            gallons_per_pulse: 1,
            checkpoint_interval_secs: 300,
            stop_wait_cycles: 3,
            stop_wait_secs: 5,
            report_max_age_days: 2,
            max_event_hours: 4,
            pulse_debounce_ms: 200,
            pulse_channel_capacity: 4096,
            flow_check_window_secs: 60,
            hardware: HardwareBackend::Sysfs,
            simulated_gpm: 15,
        }
    }
}

impl Config {
    /// Parse a TOML document; absent keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning `Ok(None)` if it does not exist.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))
            .map(Some)
    }

    /// Resolve the config for this invocation.
    ///
    /// Priority:
    /// 1. explicit path (CLI flag) - must exist
    /// 2. `VINECTL_CONFIG` environment variable - must exist
    /// 3. `<config_dir>/vinectl/config.toml` if present
    /// 4. built-in defaults
    ///
    /// `VINECTL_ROOT` overrides `root` regardless of source.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);

        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_file(&path)?
                .with_context(|| format!("Config file not found: {}", path.display()))?,
            None => match dirs::config_dir().map(|d| d.join("vinectl").join("config.toml")) {
                Some(path) => Self::load_file(&path)?.unwrap_or_default(),
                None => Self::default(),
            },
        };

        if let Some(root) = std::env::var_os(ROOT_ENV) {
            if !root.is_empty() {
                config.root = PathBuf::from(root);
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gallons_per_pulse == 0 {
            bail!("gallons_per_pulse must be greater than zero");
        }
        if self.valves.is_empty() {
            bail!("at least one block/valve mapping is required");
        }
        if self.stop_wait_cycles == 0 {
            bail!("stop_wait_cycles must be greater than zero");
        }
        // one wait cycle must cover at least one supervisor stop poll
        if self.stop_wait_secs == 0 {
            bail!("stop_wait_secs must be at least 1");
        }
        if self.max_event_hours == 0 {
            bail!("max_event_hours must be greater than zero");
        }
        if self.pulse_channel_capacity == 0 {
            bail!("pulse_channel_capacity must be greater than zero");
        }
        if self.checkpoint_interval_secs == 0 {
            bail!("checkpoint_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &str> {
        self.valves.keys().map(String::as_str)
    }

    pub fn is_known_block(&self, block: &str) -> bool {
        self.valves.contains_key(block)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_wait_secs)
    }

    /// How often a running supervisor looks for a stop request. Never
    /// longer than one controller wait cycle.
    pub fn stop_poll(&self) -> Duration {
        self.stop_wait().clamp(MIN_STOP_POLL, MAX_STOP_POLL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pulse_debounce(&self) -> Duration {
        Duration::from_millis(self.pulse_debounce_ms)
    }
}
