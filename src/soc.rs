//! State-of-charge estimation from pack voltage
//!
//! Maps a per-cell voltage, adjusted for whether the pack is charging or
//! discharging, onto a chemistry-specific breakpoint curve with linear
//! interpolation. Output is always clamped to [0, 100].

use crate::battery::{BatteryProfile, Chemistry};
use serde::Serialize;

/// Charge-state classification of the pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeState {
    Charging,
    Discharging,
    Resting,
}

/// Classify pack activity against the 1%-of-capacity power threshold.
/// Power exactly at the threshold counts as resting.
pub fn classify_charge_state(charge_power_w: f64, threshold_w: f64) -> ChargeState {
    if charge_power_w > threshold_w {
        ChargeState::Charging
    } else if charge_power_w < -threshold_w {
        ChargeState::Discharging
    } else {
        ChargeState::Resting
    }
}

/// Fixed per-chemistry voltage offset applied before curve lookup, modeling
/// the separation between the charge and discharge legs of the curve.
fn voltage_offset(chemistry: Chemistry, state: ChargeState) -> f64 {
    match (chemistry, state) {
        (Chemistry::Ncm, ChargeState::Charging) => -0.05,
        (Chemistry::Ncm, ChargeState::Discharging) => 0.03,
        (Chemistry::LiFePo4, ChargeState::Charging) => -0.10,
        (Chemistry::LiFePo4, ChargeState::Discharging) => 0.05,
        (_, ChargeState::Resting) => 0.0,
    }
}

/// NCM per-cell voltage to percent breakpoints
const NCM_CURVE: [(f64, f64); 11] = [
    (3.00, 0.0),
    (3.30, 7.0),
    (3.40, 10.0),
    (3.50, 15.0),
    (3.60, 25.0),
    (3.70, 40.0),
    (3.80, 55.0),
    (3.90, 70.0),
    (4.00, 85.0),
    (4.10, 95.0),
    (4.20, 100.0),
];

/// LiFePO4 per-cell voltage to percent breakpoints.
/// The 3.13 V to 3.14 V segment is the near-flat transition zone at the
/// plateau edge (5.5% to 9%) and is an interpolation segment like any other.
const LFP_CURVE: [(f64, f64); 8] = [
    (3.00, 0.0),
    (3.10, 2.0),
    (3.13, 5.5),
    (3.14, 9.0),
    (3.20, 20.0),
    (3.30, 60.0),
    (3.45, 90.0),
    (3.65, 100.0),
];

fn curve(chemistry: Chemistry) -> &'static [(f64, f64)] {
    match chemistry {
        Chemistry::Ncm => &NCM_CURVE,
        Chemistry::LiFePo4 => &LFP_CURVE,
    }
}

/// Linear interpolation over an ordered breakpoint table. Voltages below
/// the first breakpoint take its percent; voltages above the last take its
/// percent.
fn interpolate(points: &[(f64, f64)], voltage: f64) -> f64 {
    let (first_v, first_pct) = points[0];
    if voltage <= first_v {
        return first_pct;
    }
    for pair in points.windows(2) {
        let (lo_v, lo_pct) = pair[0];
        let (hi_v, hi_pct) = pair[1];
        if voltage <= hi_v {
            let t = (voltage - lo_v) / (hi_v - lo_v);
            return lo_pct + t * (hi_pct - lo_pct);
        }
    }
    let (_, last_pct) = points[points.len() - 1];
    last_pct
}

/// Estimate state of charge (percent, clamped to [0, 100]) for a pack
/// voltage and signed charge power (positive = charging).
pub fn estimate(profile: &BatteryProfile, pack_voltage: f64, charge_power_w: f64) -> f64 {
    let state = classify_charge_state(charge_power_w, profile.one_percent_power_w);
    let per_cell =
        profile.per_cell_voltage(pack_voltage) + voltage_offset(profile.chemistry, state);
    interpolate(curve(profile.chemistry), per_cell).clamp(0.0, 100.0)
}
