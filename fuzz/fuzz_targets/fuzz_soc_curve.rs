#![no_main]
use libfuzzer_sys::fuzz_target;
use talos::battery::{BatteryProfile, Chemistry};

fuzz_target!(|data: &[u8]| {
    if data.len() < 18 {
        return;
    }

    let chemistry = if data[0] & 1 == 0 {
        Chemistry::Ncm
    } else {
        Chemistry::LiFePo4
    };
    // Covers both valid and rejected cell counts
    let cell_count = u32::from(data[1] % 36);
    let voltage = f64::from_le_bytes(data[2..10].try_into().unwrap());
    let power = f64::from_le_bytes(data[10..18].try_into().unwrap());

    let Ok(profile) = BatteryProfile::resolve(chemistry, cell_count, Some(100.0)) else {
        return;
    };

    // The engine drops non-finite samples before estimating, so the
    // estimator's range guarantee only holds for finite inputs
    if !voltage.is_finite() || !power.is_finite() {
        return;
    }

    let soc = talos::soc::estimate(&profile, voltage, power);
    assert!((0.0..=100.0).contains(&soc));
});
