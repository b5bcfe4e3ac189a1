//! Code for the configuration of the fleet daemon.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::machine::{AutomationConfig, ClearingStrategy, MachineMakeModel};

/// The configuration of the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Scheduler settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Watchdog / fault-recovery settings.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Time boxes for the suspension points of the pipeline.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Directory holding the base printable files jobs refer to.
    #[serde(default = "Config::default_files_dir")]
    pub files_dir: PathBuf,

    /// Per-machine entries.
    #[serde(default)]
    pub machines: Vec<MachineEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: Default::default(),
            watchdog: Default::default(),
            timeouts: Default::default(),
            files_dir: Self::default_files_dir(),
            machines: Vec::new(),
        }
    }
}

impl Config {
    fn default_files_dir() -> PathBuf {
        PathBuf::from("gcode")
    }

    /// Parse a configuration from a toml file.
    pub fn from_file(file: &PathBuf) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(toml::from_str(config)?)
    }

    /// Get the entry for a machine.
    pub fn get_machine(&self, serial: &str) -> Option<&MachineEntry> {
        self.machines.iter().find(|m| m.serial == serial)
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Seconds between scheduling ticks. Interval-driven on purpose;
    /// reacting to every state change would race concurrent claims on
    /// shared device state.
    #[serde(default = "DispatcherConfig::default_tick_secs")]
    pub tick_secs: u64,
}

impl DispatcherConfig {
    fn default_tick_secs() -> u64 {
        10
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_secs: Self::default_tick_secs(),
        }
    }
}

/// Watchdog / fault-recovery settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct WatchdogConfig {
    /// Maximum automatic retries of a recoverable motion fault before
    /// escalating to an error.
    #[serde(default = "WatchdogConfig::default_retry_limit")]
    pub retry_limit: u32,
}

impl WatchdogConfig {
    fn default_retry_limit() -> u32 {
        1
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            retry_limit: Self::default_retry_limit(),
        }
    }
}

/// Time boxes for the suspension points of the pipeline. A timeout is
/// always treated as the corresponding failure path, never as success.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Maximum seconds for a file transfer plus execution start.
    #[serde(default = "TimeoutConfig::default_upload_secs")]
    pub upload_secs: u64,

    /// Maximum seconds for the physical clearing motion to be
    /// acknowledged.
    #[serde(default = "TimeoutConfig::default_clearing_secs")]
    pub clearing_secs: u64,

    /// Seconds of telemetry silence before a device is considered
    /// offline.
    #[serde(default = "TimeoutConfig::default_offline_secs")]
    pub offline_secs: u64,
}

impl TimeoutConfig {
    fn default_upload_secs() -> u64 {
        300
    }

    fn default_clearing_secs() -> u64 {
        180
    }

    fn default_offline_secs() -> u64 {
        90
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upload_secs: Self::default_upload_secs(),
            clearing_secs: Self::default_clearing_secs(),
            offline_secs: Self::default_offline_secs(),
        }
    }
}

/// Configuration for a single machine in the fleet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineEntry {
    /// The device serial. Immutable key.
    pub serial: String,

    /// Operator-facing name. Defaults to the serial.
    #[serde(default)]
    pub name: Option<String>,

    /// Model line, e.g. "A1" or "X1C".
    #[serde(default)]
    pub model: Option<String>,

    /// Whether the scheduler may queue to this device.
    #[serde(default = "MachineEntry::default_true")]
    pub queueing_enabled: bool,

    /// Whether finished parts may be cleared without an operator.
    #[serde(default)]
    pub auto_eject: bool,

    /// Bed temperature (celsius) below which ejection is safe.
    #[serde(default = "MachineEntry::default_thermal_release")]
    pub thermal_release_temp: f64,

    /// How parts come off the plate.
    #[serde(default = "MachineEntry::default_strategy")]
    pub clearing_strategy: ClearingStrategy,
}

impl MachineEntry {
    fn default_true() -> bool {
        true
    }

    fn default_thermal_release() -> f64 {
        crate::clearing::DEFAULT_THERMAL_RELEASE_TEMP
    }

    fn default_strategy() -> ClearingStrategy {
        ClearingStrategy::Manual
    }

    /// The automation policy this entry describes.
    pub fn automation(&self) -> AutomationConfig {
        AutomationConfig {
            queueing_enabled: self.queueing_enabled,
            auto_eject: self.auto_eject,
            thermal_release_temp: self.thermal_release_temp,
            clearing_strategy: self.clearing_strategy,
        }
    }

    /// Display name, falling back to the serial.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial)
    }

    /// Make/model information for snapshots.
    pub fn make_model(&self) -> MachineMakeModel {
        MachineMakeModel {
            manufacturer: Some("Bambu Lab".to_owned()),
            model: self.model.clone(),
        }
    }
}
