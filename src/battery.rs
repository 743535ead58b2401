//! Battery chemistry tables and pack profile resolution
//!
//! Turns the configured (chemistry, cell count, capacity) triple into a
//! validated set of pack-level voltage thresholds plus the capacity-derived
//! power threshold used by the SoC estimator. Per-cell constants are fixed
//! per chemistry and never user-supplied, so the threshold ordering
//! invariant holds by construction.

use crate::error::{Result, TalosError};
use serde::{Deserialize, Serialize};

/// Supported cell chemistries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chemistry {
    #[serde(rename = "NCM", alias = "ncm")]
    Ncm,
    #[serde(rename = "LiFePO4", alias = "lifepo4")]
    LiFePo4,
}

impl std::fmt::Display for Chemistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chemistry::Ncm => write!(f, "NCM"),
            Chemistry::LiFePo4 => write!(f, "LiFePO4"),
        }
    }
}

/// Per-cell voltage thresholds (volts)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellThresholds {
    pub low_enable: f64,
    pub low_disable: f64,
    pub high_protect: f64,
    pub emergency: f64,
}

impl Chemistry {
    /// Fixed per-cell threshold row for this chemistry
    pub const fn cell_thresholds(self) -> CellThresholds {
        match self {
            Chemistry::Ncm => CellThresholds {
                low_enable: 3.39,
                low_disable: 3.54,
                high_protect: 4.10,
                emergency: 4.20,
            },
            Chemistry::LiFePo4 => CellThresholds {
                low_enable: 3.00,
                low_disable: 3.25,
                high_protect: 3.45,
                emergency: 3.65,
            },
        }
    }

    /// Nominal per-cell voltage used for capacity derivation
    pub const fn nominal_cell_voltage(self) -> f64 {
        match self {
            Chemistry::Ncm => 3.7,
            Chemistry::LiFePo4 => 3.2,
        }
    }

    /// Supported series cell counts, inclusive
    pub const fn cell_count_range(self) -> (u32, u32) {
        match self {
            Chemistry::Ncm => (4, 24),
            Chemistry::LiFePo4 => (4, 32),
        }
    }
}

/// Pack-level voltage thresholds (per-cell row scaled by cell count)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackThresholds {
    pub low_enable: f64,
    pub low_disable: f64,
    pub high_protect: f64,
    pub emergency: f64,
}

/// Resolved battery profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatteryProfile {
    pub chemistry: Chemistry,
    pub cell_count: u32,
    pub capacity_ah: f64,
    pub nominal_cell_voltage: f64,
    pub pack: PackThresholds,
    pub capacity_kwh: f64,
    /// 1% of pack capacity expressed in watts; the charge/discharge
    /// classification threshold
    pub one_percent_power_w: f64,
}

impl BatteryProfile {
    /// Resolve a profile from the configured pack description.
    ///
    /// A missing or nonpositive capacity rating is a refusal: callers must
    /// not command the actuator and must leave the decision state untouched.
    pub fn resolve(chemistry: Chemistry, cell_count: u32, capacity_ah: Option<f64>) -> Result<Self> {
        let (min_cells, max_cells) = chemistry.cell_count_range();
        if cell_count < min_cells || cell_count > max_cells {
            return Err(TalosError::config(format!(
                "Unsupported cell count {} for {} (supported {}..={})",
                cell_count, chemistry, min_cells, max_cells
            )));
        }

        let ah = capacity_ah.ok_or_else(|| {
            TalosError::config("Battery capacity (Ah) is not configured; refusing to act")
        })?;
        if !ah.is_finite() || ah <= 0.0 {
            return Err(TalosError::config(format!(
                "Battery capacity must be a positive number of Ah, got {}",
                ah
            )));
        }

        let cells = f64::from(cell_count);
        let per_cell = chemistry.cell_thresholds();
        let pack = PackThresholds {
            low_enable: per_cell.low_enable * cells,
            low_disable: per_cell.low_disable * cells,
            high_protect: per_cell.high_protect * cells,
            emergency: per_cell.emergency * cells,
        };

        let nominal = chemistry.nominal_cell_voltage();
        let capacity_kwh = nominal * cells * ah / 1000.0;
        let one_percent_power_w = capacity_kwh * 1000.0 * 0.01;

        Ok(Self {
            chemistry,
            cell_count,
            capacity_ah: ah,
            nominal_cell_voltage: nominal,
            pack,
            capacity_kwh,
            one_percent_power_w,
        })
    }

    /// Pack voltage divided by series cell count
    pub fn per_cell_voltage(&self, pack_voltage: f64) -> f64 {
        pack_voltage / f64::from(self.cell_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_ordered_for_all_supported_counts() {
        for chem in [Chemistry::Ncm, Chemistry::LiFePo4] {
            let (min, max) = chem.cell_count_range();
            for cells in min..=max {
                let p = BatteryProfile::resolve(chem, cells, Some(100.0)).unwrap();
                assert!(
                    p.pack.low_enable < p.pack.low_disable,
                    "{} {}S low ordering",
                    chem,
                    cells
                );
                assert!(p.pack.low_disable < p.pack.high_protect);
                assert!(p.pack.high_protect < p.pack.emergency);
            }
        }
    }

    #[test]
    fn ncm_15s_pack_values() {
        let p = BatteryProfile::resolve(Chemistry::Ncm, 15, Some(280.0)).unwrap();
        assert!((p.pack.low_enable - 50.85).abs() < 1e-9);
        assert!((p.pack.low_disable - 53.1).abs() < 1e-9);
        assert!((p.pack.high_protect - 61.5).abs() < 1e-9);
        assert!((p.pack.emergency - 63.0).abs() < 1e-9);
        assert!((p.capacity_kwh - 15.54).abs() < 1e-9);
        assert!((p.one_percent_power_w - 155.4).abs() < 1e-9);
    }

    #[test]
    fn lifepo4_16s_pack_values() {
        let p = BatteryProfile::resolve(Chemistry::LiFePo4, 16, Some(200.0)).unwrap();
        assert!((p.pack.emergency - 58.4).abs() < 1e-9);
        assert!((p.capacity_kwh - 10.24).abs() < 1e-9);
        assert!((p.one_percent_power_w - 102.4).abs() < 1e-9);
    }

    #[test]
    fn missing_capacity_is_refused() {
        let err = BatteryProfile::resolve(Chemistry::Ncm, 15, None).unwrap_err();
        assert!(matches!(err, TalosError::Config { .. }));
    }

    #[test]
    fn nonpositive_capacity_is_refused() {
        for bad in [0.0, -5.0, f64::NAN] {
            let err = BatteryProfile::resolve(Chemistry::LiFePo4, 16, Some(bad)).unwrap_err();
            assert!(matches!(err, TalosError::Config { .. }), "ah={}", bad);
        }
    }

    #[test]
    fn out_of_range_cell_count_is_refused() {
        assert!(BatteryProfile::resolve(Chemistry::Ncm, 3, Some(100.0)).is_err());
        assert!(BatteryProfile::resolve(Chemistry::Ncm, 25, Some(100.0)).is_err());
        assert!(BatteryProfile::resolve(Chemistry::LiFePo4, 33, Some(100.0)).is_err());
        assert!(BatteryProfile::resolve(Chemistry::LiFePo4, 32, Some(100.0)).is_ok());
    }

    #[test]
    fn per_cell_voltage_divides_by_count() {
        let p = BatteryProfile::resolve(Chemistry::Ncm, 15, Some(280.0)).unwrap();
        assert!((p.per_cell_voltage(50.0) - 50.0 / 15.0).abs() < 1e-12);
    }
}
