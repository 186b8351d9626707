// src/config.rs - YAML configuration: service timing defaults plus the
// alarm definitions the raisers register at startup.

use crate::error::{Result, SirenError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

fn default_poll_interval() -> u64 {
    30
}

fn default_silence_secs() -> u64 {
    300
}

fn default_test_secs() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

/// One configured alarm. Local alarms watch a hardware pin; remote alarms
/// relay alerts from a named source service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmDefinition {
    /// Stable identifier, unique across the config
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Source service for remote alarms; empty or absent means local
    #[serde(default)]
    pub source: Option<String>,
    /// Input pin for local alarms
    #[serde(default)]
    pub pin: u8,
    /// Consecutive readings required before a local raise or lower
    #[serde(default)]
    pub noise_threshold: u32,
    /// Whether operators may disable this alarm
    #[serde(default = "default_enabled")]
    pub can_disable: bool,
    /// Whether the alarm participates at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AlarmDefinition {
    /// Whether this definition describes a locally sensed alarm.
    pub fn is_local(&self) -> bool {
        self.source.as_deref().map_or(true, |s| s.is_empty())
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between update polls and status broadcasts
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Default silence window when a command omits the duration
    #[serde(default = "default_silence_secs")]
    pub default_silence_secs: u64,
    /// Default alarm/output test duration when a command omits it
    #[serde(default = "default_test_secs")]
    pub default_test_secs: u64,
    /// Change-log file; in-memory only when absent
    #[serde(default)]
    pub log_file: Option<String>,
    /// Alarms to register at startup
    #[serde(default)]
    pub alarms: Vec<AlarmDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            default_silence_secs: default_silence_secs(),
            default_test_secs: default_test_secs(),
            log_file: None,
            alarms: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a config from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a config from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(SirenError::Config(
                "poll_interval_secs must be positive".into(),
            ));
        }
        if self.default_silence_secs == 0 {
            return Err(SirenError::Config(
                "default_silence_secs must be positive".into(),
            ));
        }
        if self.default_test_secs == 0 {
            return Err(SirenError::Config(
                "default_test_secs must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for def in &self.alarms {
            if def.id.is_empty() {
                return Err(SirenError::Config("alarm id must not be empty".into()));
            }
            if !seen.insert(def.id.as_str()) {
                return Err(SirenError::Config(format!(
                    "duplicate alarm id '{}'",
                    def.id
                )));
            }
            if def.name.is_empty() {
                return Err(SirenError::Config(format!(
                    "alarm '{}' has no name",
                    def.id
                )));
            }
            if def.is_local() && def.enabled && def.pin == 0 {
                return Err(SirenError::Config(format!(
                    "local alarm '{}' needs a non-zero pin",
                    def.id
                )));
            }
        }
        Ok(())
    }
}
