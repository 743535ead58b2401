//! Configuration management for Talos
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::battery::Chemistry;
use crate::error::{Result, TalosError};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Battery pack description
    pub battery: BatteryConfig,

    /// AC load condition thresholds
    pub load: LoadConfig,

    /// State-of-charge condition and protection thresholds
    pub soc: SocConfig,

    /// Off-peak schedule window
    pub schedule: ScheduleConfig,

    /// Actuator selection
    pub control: ControlConfig,

    /// Device instance for D-Bus service naming
    pub device_instance: u32,

    /// Require D-Bus to be available; fail fast on startup if unavailable
    #[serde(default = "default_true")]
    pub require_dbus: bool,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Timezone for the schedule condition (IANA name, e.g. "Europe/Amsterdam")
    pub timezone: String,
}

/// Battery pack description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Cell chemistry
    pub chemistry: Chemistry,

    /// Number of series cells
    pub cell_count: u32,

    /// Rated capacity in amp hours. The engine refuses to command the
    /// actuator until this is set to a positive value.
    pub capacity_ah: Option<f64>,
}

/// AC load condition thresholds (watts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Load above this enables the grid after the debounce
    pub enable_watts: f64,

    /// Load below this releases the condition immediately
    pub disable_watts: f64,
}

/// State-of-charge thresholds (percent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocConfig {
    /// SoC below this enables the grid after the debounce
    pub low_enable: f64,

    /// SoC above this releases the condition immediately
    pub low_disable: f64,

    /// SoC at or above this trips standard protection
    pub high_protect: f64,
}

/// Off-peak schedule window, half-open [start_hour, end_hour) in local time.
/// start_hour == end_hour disables the window; start_hour > end_hour wraps
/// past midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub start_hour: u8,
    pub end_hour: u8,
}

/// How the grid connection is actuated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMethod {
    /// Prefer the vebus AC input control when a vebus service exists,
    /// otherwise fall back to the relay
    Auto,
    /// Write /Ac/Control/IgnoreAcIn1 on the vebus service
    DirectAcInput,
    /// Write /Relay/1/State on the system service
    Relay,
}

/// Actuator selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Actuation method
    pub method: ControlMethod,

    /// Relay index on the GX device (relay 0 is commonly reserved for
    /// generator start)
    pub relay_index: u8,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level override
    pub console_level: Option<String>,

    /// Optional file-specific level override
    pub file_level: Option<String>,

    /// Optional web-stream-specific level override
    pub web_level: Option<String>,

    /// Path to log file (or directory for the rolling appender)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            chemistry: Chemistry::LiFePo4,
            cell_count: 16,
            capacity_ah: None,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            enable_watts: 2500.0,
            disable_watts: 300.0,
        }
    }
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            low_enable: 20.0,
            low_disable: 30.0,
            high_protect: 97.0,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: 0,
            end_hour: 0,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            method: ControlMethod::Auto,
            relay_index: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            web_level: None,
            file: "/tmp/talos.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            battery: BatteryConfig::default(),
            load: LoadConfig::default(),
            soc: SocConfig::default(),
            schedule: ScheduleConfig::default(),
            control: ControlConfig::default(),
            device_instance: 0,
            require_dbus: true,
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
            poll_interval_ms: 1000,
            timezone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = [
            "talos_config.yaml",
            "/data/talos_config.yaml",
            "/etc/talos/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    ///
    /// Structural checks only. A missing capacity rating passes validation;
    /// the battery profile resolver refuses it at evaluation time instead,
    /// which keeps the process running while failing closed.
    pub fn validate(&self) -> Result<()> {
        let (min_cells, max_cells) = self.battery.chemistry.cell_count_range();
        if self.battery.cell_count < min_cells || self.battery.cell_count > max_cells {
            return Err(TalosError::validation(
                "battery.cell_count".to_string(),
                format!(
                    "Must be within {}..={} for {}",
                    min_cells, max_cells, self.battery.chemistry
                ),
            ));
        }

        if let Some(ah) = self.battery.capacity_ah
            && (!ah.is_finite() || ah <= 0.0)
        {
            return Err(TalosError::validation(
                "battery.capacity_ah",
                "Must be a positive number",
            ));
        }

        if self.schedule.start_hour > 23 || self.schedule.end_hour > 23 {
            return Err(TalosError::validation(
                "schedule",
                "Hours must be within 0..=23",
            ));
        }

        if self.web.port == 0 {
            return Err(TalosError::validation(
                "web.port",
                "Port must be greater than 0",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(TalosError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.battery.chemistry, Chemistry::LiFePo4);
        assert_eq!(config.battery.cell_count, 16);
        assert!(config.battery.capacity_ah.is_none());
        assert_eq!(config.poll_interval_ms, 1000);
        assert!(config.require_dbus);
        assert!(config.load.enable_watts > config.load.disable_watts);
        assert!(config.soc.low_enable < config.soc.low_disable);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        // Unsupported cell count
        config.battery.cell_count = 2;
        assert!(config.validate().is_err());

        // Reset and test invalid schedule hour
        config = Config::default();
        config.schedule.end_hour = 24;
        assert!(config.validate().is_err());

        // Nonpositive capacity is rejected when present
        config = Config::default();
        config.battery.capacity_ah = Some(0.0);
        assert!(config.validate().is_err());

        // Missing capacity still validates; the resolver refuses it later
        config = Config::default();
        config.battery.capacity_ah = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.battery.capacity_ah = Some(280.0);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.battery, deserialized.battery);
        assert_eq!(config.web.port, deserialized.web.port);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "battery:\n  chemistry: NCM\n  cell_count: 15\n  capacity_ah: 280\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.battery.chemistry, Chemistry::Ncm);
        assert_eq!(config.battery.cell_count, 15);
        assert_eq!(config.battery.capacity_ah, Some(280.0));
        assert_eq!(config.web.port, 8088);
        assert_eq!(config.load.enable_watts, 2500.0);
    }

    #[test]
    fn test_control_method_kebab_case() {
        let yaml = "control:\n  method: direct-ac-input\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.control.method, ControlMethod::DirectAcInput);
    }
}
