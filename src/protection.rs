//! Latched high-voltage and high-SoC protections
//!
//! Two latches guard the top of the charge curve. The standard protection
//! trips when pack voltage or SoC reaches its ceiling and holds until both
//! readings retreat below a clearance band. The emergency protection trips
//! on pack voltage alone at the absolute cell maximum and can never be
//! overridden. Neither latch is debounced: overshoot at the top of the
//! charge curve gets an instant response.

use crate::logging::{StructuredLogger, get_logger};

/// Hysteresis below the standard trip voltage before the latch clears
pub const STANDARD_CLEAR_VOLTAGE_BAND: f64 = 0.75;
/// Hysteresis below the standard SoC ceiling before the latch clears
pub const STANDARD_CLEAR_SOC_BAND: f64 = 2.5;
/// Hysteresis below the emergency trip voltage before the latch clears
pub const EMERGENCY_CLEAR_VOLTAGE_BAND: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    Clear,
    Active,
}

impl ProtectionState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Trip points consumed by the latches each cycle
#[derive(Debug, Clone, Copy)]
pub struct ProtectionThresholds {
    pub high_protect_v: f64,
    pub high_soc_percent: f64,
    pub emergency_v: f64,
}

/// The standard and emergency protection latches
pub struct ProtectionLatches {
    standard: ProtectionState,
    emergency: ProtectionState,
    logger: StructuredLogger,
}

impl ProtectionLatches {
    pub fn new() -> Self {
        Self {
            standard: ProtectionState::Clear,
            emergency: ProtectionState::Clear,
            logger: get_logger("protection"),
        }
    }

    pub fn standard(&self) -> ProtectionState {
        self.standard
    }

    pub fn emergency(&self) -> ProtectionState {
        self.emergency
    }

    /// True when the standard latch is active and no load override applies.
    /// Only an enabled load condition may override it; schedule, voltage
    /// and SoC conditions never do.
    pub fn standard_blocking(&self, load_enabled: bool) -> bool {
        self.standard.is_active() && !load_enabled
    }

    /// Advance both latches against the current readings.
    ///
    /// Trips use `>=` so a reading exactly at a ceiling already counts as
    /// breached. The standard latch clears only when voltage and SoC have
    /// both retreated below their clearance bands.
    pub fn evaluate(&mut self, pack_voltage: f64, soc_percent: f64, th: &ProtectionThresholds) {
        let next_standard = match self.standard {
            ProtectionState::Clear => {
                if pack_voltage >= th.high_protect_v || soc_percent >= th.high_soc_percent {
                    ProtectionState::Active
                } else {
                    ProtectionState::Clear
                }
            }
            ProtectionState::Active => {
                if pack_voltage < th.high_protect_v - STANDARD_CLEAR_VOLTAGE_BAND
                    && soc_percent < th.high_soc_percent - STANDARD_CLEAR_SOC_BAND
                {
                    ProtectionState::Clear
                } else {
                    ProtectionState::Active
                }
            }
        };

        let next_emergency = match self.emergency {
            ProtectionState::Clear => {
                if pack_voltage >= th.emergency_v {
                    ProtectionState::Active
                } else {
                    ProtectionState::Clear
                }
            }
            ProtectionState::Active => {
                if pack_voltage < th.emergency_v - EMERGENCY_CLEAR_VOLTAGE_BAND {
                    ProtectionState::Clear
                } else {
                    ProtectionState::Active
                }
            }
        };

        if next_standard != self.standard {
            match next_standard {
                ProtectionState::Active => self.logger.warn(&format!(
                    "Standard high protection tripped at {pack_voltage:.2} V, SoC {soc_percent:.1}%"
                )),
                ProtectionState::Clear => self.logger.info(&format!(
                    "Standard high protection cleared at {pack_voltage:.2} V, SoC {soc_percent:.1}%"
                )),
            }
        }
        if next_emergency != self.emergency {
            match next_emergency {
                ProtectionState::Active => self.logger.error(&format!(
                    "Emergency voltage protection tripped at {pack_voltage:.2} V"
                )),
                ProtectionState::Clear => self.logger.info(&format!(
                    "Emergency voltage protection cleared at {pack_voltage:.2} V"
                )),
            }
        }

        self.standard = next_standard;
        self.emergency = next_emergency;
    }
}

impl Default for ProtectionLatches {
    fn default() -> Self {
        Self::new()
    }
}
