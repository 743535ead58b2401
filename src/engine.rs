//! Grid connection decision engine
//!
//! One [`Controller`] owns the whole decision pipeline: resolve the battery
//! profile, estimate SoC, run the debounced conditions and protection
//! latches, then arbitrate a single actuator command. Arbitration is a
//! strict priority ladder:
//!
//! 1. emergency protection forces grid off, nothing overrides it
//! 2. standard protection forces grid off unless the load condition holds
//! 3. any enabled condition connects a disconnected grid
//! 4. with no conditions left the disconnect is delayed by 30 seconds
//! 5. a condition returning during that delay cancels the disconnect
//!
//! The controller never reads the clock itself. Every entry point takes the
//! caller's `Instant`, which keeps the timing paths deterministic in tests.

use crate::battery::BatteryProfile;
use crate::conditions::{ConditionSet, ConditionThresholds};
use crate::config::{BatteryConfig, Config, LoadConfig, SocConfig};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::protection::{ProtectionLatches, ProtectionThresholds};
use crate::soc;
use chrono::{DateTime, Local, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Window after startup during which an idle grid is not yet disconnected
pub const STARTUP_GRACE: Duration = Duration::from_secs(30);
/// Delay between the last condition releasing and the actual disconnect
pub const DISABLE_DELAY: Duration = Duration::from_secs(30);

/// Plausibility ceiling for a pack voltage reading
pub const MAX_PACK_VOLTAGE: f64 = 100.0;
/// Plausibility ceiling for an AC load reading
pub const MAX_AC_LOAD_W: f64 = 50_000.0;

/// One telemetry sample as read from the system service
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Pack terminal voltage in volts
    pub voltage: f64,
    /// Total AC consumption in watts, never negative on a sane meter
    pub ac_load: f64,
    /// Battery DC power in watts, positive while charging
    pub charge_power: f64,
    /// Wall-clock time the sample was taken, used for the schedule window
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Reject readings outside physical plausibility. An implausible
    /// sample is dropped for the cycle and all state is held.
    pub fn validity_error(&self) -> Option<String> {
        if !self.voltage.is_finite() || self.voltage < 0.0 || self.voltage > MAX_PACK_VOLTAGE {
            return Some(format!(
                "pack voltage {:.2} V outside plausible range 0 to {MAX_PACK_VOLTAGE} V",
                self.voltage
            ));
        }
        if !self.ac_load.is_finite() || self.ac_load < 0.0 || self.ac_load > MAX_AC_LOAD_W {
            return Some(format!(
                "AC load {:.0} W outside plausible range 0 to {MAX_AC_LOAD_W} W",
                self.ac_load
            ));
        }
        None
    }
}

/// Current position of the decision state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionState {
    GridOn,
    GridOff,
    /// Grid still energized, disconnect armed for the held deadline.
    /// Leaving this state drops the deadline with it, so a cancelled
    /// disconnect can never fire late.
    PendingDisable(Instant),
}

impl DecisionState {
    /// Whether the actuator should be energized in this state
    pub fn actuator_on(self) -> bool {
        !matches!(self, Self::GridOff)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GridOn => "grid_on",
            Self::GridOff => "grid_off",
            Self::PendingDisable(_) => "pending_disable",
        }
    }
}

/// A command for the grid actuator, produced only on state transitions
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorRequest {
    pub on: bool,
    pub reason: String,
}

/// Per-cycle resolution of the raw config into engine inputs
struct RuntimeConfig {
    profile: BatteryProfile,
    conditions: ConditionThresholds,
    protections: ProtectionThresholds,
    tz: Option<Tz>,
}

/// Serializable view of the controller for D-Bus export and the web API
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub state: &'static str,
    pub grid_on: bool,
    pub reason: String,
    /// Seconds until an armed disconnect fires
    pub pending_disable_remaining_s: Option<f64>,
    pub soc: Option<f64>,
    pub capacity_kwh: Option<f64>,
    pub chemistry: Option<String>,
    pub cell_count: Option<u32>,
    pub conditions: ConditionFlags,
    pub protections: ProtectionFlags,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConditionFlags {
    pub load: bool,
    pub voltage: bool,
    pub soc: bool,
    pub time: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProtectionFlags {
    pub standard: bool,
    pub emergency: bool,
}

/// The decision engine. Single-threaded by design: the driver owns it and
/// feeds it one sample at a time.
pub struct Controller {
    conditions: ConditionSet,
    protections: ProtectionLatches,
    state: DecisionState,
    grace_until: Instant,
    profile_cache: Option<(BatteryConfig, BatteryProfile)>,
    last_soc: Option<f64>,
    last_reason: String,
    warned_load_order: bool,
    warned_soc_order: bool,
    warned_timezone: bool,
    logger: StructuredLogger,
}

impl Controller {
    /// A fresh controller starts with the grid connected and a startup
    /// grace window, so a restart never drops an active connection.
    pub fn new(now: Instant) -> Self {
        Self {
            conditions: ConditionSet::new(),
            protections: ProtectionLatches::new(),
            state: DecisionState::GridOn,
            grace_until: now + STARTUP_GRACE,
            profile_cache: None,
            last_soc: None,
            last_reason: "grid on: startup default".to_string(),
            warned_load_order: false,
            warned_soc_order: false,
            warned_timezone: false,
            logger: get_logger("engine"),
        }
    }

    /// The one unconditional command, issued once right after startup to
    /// bring the actuator in line with the initial state.
    pub fn startup_command(&self) -> ActuatorRequest {
        ActuatorRequest {
            on: true,
            reason: self.last_reason.clone(),
        }
    }

    pub fn state(&self) -> DecisionState {
        self.state
    }

    pub fn last_reason(&self) -> &str {
        &self.last_reason
    }

    pub fn conditions(&self) -> &ConditionSet {
        &self.conditions
    }

    pub fn protections(&self) -> &ProtectionLatches {
        &self.protections
    }

    /// Earliest instant at which a timer held by the engine can fire:
    /// a condition debounce or the pending disconnect.
    pub fn next_deadline(&self) -> Option<Instant> {
        let pending = match self.state {
            DecisionState::PendingDisable(deadline) => Some(deadline),
            _ => None,
        };
        [self.conditions.next_deadline(), pending]
            .into_iter()
            .flatten()
            .min()
    }

    /// Run one decision cycle. Returns an actuator command when and only
    /// when the commanded grid state changes. A configuration error is
    /// fatal for the cycle: no command, no state change.
    pub fn evaluate(
        &mut self,
        config: &Config,
        sample: &Sample,
        now: Instant,
    ) -> Result<Option<ActuatorRequest>> {
        if let Some(problem) = sample.validity_error() {
            self.logger
                .warn(&format!("Dropping implausible sample: {problem}"));
            return Ok(None);
        }

        let rc = self.resolve_runtime(config)?;
        let soc_percent = soc::estimate(&rc.profile, sample.voltage, sample.charge_power);
        self.last_soc = Some(soc_percent);

        let local_hour = match rc.tz {
            Some(tz) => sample.timestamp.with_timezone(&tz).hour(),
            None => sample.timestamp.with_timezone(&Local).hour(),
        };

        self.conditions.evaluate(
            sample.ac_load,
            sample.voltage,
            soc_percent,
            &rc.conditions,
            local_hour,
            now,
        );
        self.protections
            .evaluate(sample.voltage, soc_percent, &rc.protections);

        Ok(self.arbitrate(now))
    }

    /// Apply the priority ladder to the freshly evaluated conditions and
    /// protections.
    fn arbitrate(&mut self, now: Instant) -> Option<ActuatorRequest> {
        let load_enabled = self.conditions.load.is_enabled();
        let emergency = self.protections.emergency().is_active();
        let standard_blocking = self.protections.standard_blocking(load_enabled);
        let any_condition = self.conditions.any_enabled();

        if emergency && !matches!(self.state, DecisionState::GridOff) {
            return Some(self.transition(
                DecisionState::GridOff,
                "grid off: emergency voltage protection active".to_string(),
            ));
        }
        if standard_blocking && !matches!(self.state, DecisionState::GridOff) {
            return Some(self.transition(
                DecisionState::GridOff,
                "grid off: high protection active".to_string(),
            ));
        }

        match self.state {
            DecisionState::GridOff => {
                if any_condition && !emergency && !standard_blocking {
                    let mut reason = format!(
                        "grid on: conditions active: {}",
                        self.conditions.active_names().join(", ")
                    );
                    if self.protections.standard().is_active() {
                        reason.push_str(" (load overrides high protection)");
                    }
                    return Some(self.transition(DecisionState::GridOn, reason));
                }
            }
            DecisionState::GridOn => {
                if !any_condition && now >= self.grace_until {
                    let deadline = now + DISABLE_DELAY;
                    self.set_state(DecisionState::PendingDisable(deadline));
                    self.last_reason = "grid off pending: no conditions active".to_string();
                    self.logger.info(&format!(
                        "No conditions active, disconnect in {} s",
                        DISABLE_DELAY.as_secs()
                    ));
                }
            }
            DecisionState::PendingDisable(deadline) => {
                if any_condition {
                    // The actuator never went off, so no command is needed
                    self.set_state(DecisionState::GridOn);
                    self.last_reason = format!(
                        "grid on: conditions active: {}",
                        self.conditions.active_names().join(", ")
                    );
                    self.logger.info("Pending disconnect cancelled");
                } else if now >= deadline {
                    return Some(self.transition(
                        DecisionState::GridOff,
                        "grid off: no conditions active".to_string(),
                    ));
                }
            }
        }
        None
    }

    fn transition(&mut self, next: DecisionState, reason: String) -> ActuatorRequest {
        self.set_state(next);
        self.last_reason = reason.clone();
        ActuatorRequest {
            on: next.actuator_on(),
            reason,
        }
    }

    fn set_state(&mut self, next: DecisionState) {
        if next != self.state {
            self.logger.info(&format!(
                "Decision state {} -> {}",
                self.state.name(),
                next.name()
            ));
            self.state = next;
        }
    }

    /// Resolve the raw config into engine inputs, reverting broken
    /// threshold groups to their documented defaults. The battery profile
    /// is cached until the battery section changes.
    fn resolve_runtime(&mut self, config: &Config) -> Result<RuntimeConfig> {
        let cached = self
            .profile_cache
            .as_ref()
            .filter(|(key, _)| *key == config.battery)
            .map(|(_, profile)| *profile);
        let profile = match cached {
            Some(profile) => profile,
            None => {
                let profile = BatteryProfile::resolve(
                    config.battery.chemistry,
                    config.battery.cell_count,
                    config.battery.capacity_ah,
                )?;
                self.logger.info(&format!(
                    "Battery profile resolved: {} {}S {:.0} Ah, {:.2} kWh",
                    profile.chemistry, profile.cell_count, profile.capacity_ah, profile.capacity_kwh
                ));
                self.profile_cache = Some((config.battery.clone(), profile));
                profile
            }
        };

        let (load_enable, load_disable) =
            if config.load.enable_watts > config.load.disable_watts {
                self.warned_load_order = false;
                (config.load.enable_watts, config.load.disable_watts)
            } else {
                if !self.warned_load_order {
                    self.logger.warn(&format!(
                        "Load thresholds misordered ({} W enable <= {} W disable), using defaults",
                        config.load.enable_watts, config.load.disable_watts
                    ));
                    self.warned_load_order = true;
                }
                let d = LoadConfig::default();
                (d.enable_watts, d.disable_watts)
            };

        // The disable level may sit exactly at the protection threshold;
        // only enable/disable misordering reverts the group
        let soc_cfg = if config.soc.low_enable < config.soc.low_disable
            && config.soc.low_disable <= config.soc.high_protect
            && config.soc.high_protect <= 100.0
        {
            self.warned_soc_order = false;
            config.soc.clone()
        } else {
            if !self.warned_soc_order {
                self.logger.warn(&format!(
                    "SoC thresholds misordered ({} / {} / {}), using defaults",
                    config.soc.low_enable, config.soc.low_disable, config.soc.high_protect
                ));
                self.warned_soc_order = true;
            }
            SocConfig::default()
        };

        let tz = match config.timezone.parse::<Tz>() {
            Ok(tz) => {
                self.warned_timezone = false;
                Some(tz)
            }
            Err(_) => {
                if !self.warned_timezone {
                    self.logger.warn(&format!(
                        "Unknown timezone '{}', falling back to system local time",
                        config.timezone
                    ));
                    self.warned_timezone = true;
                }
                None
            }
        };

        Ok(RuntimeConfig {
            profile,
            conditions: ConditionThresholds {
                load_enable_w: load_enable,
                load_disable_w: load_disable,
                voltage_low_enable: profile.pack.low_enable,
                voltage_low_disable: profile.pack.low_disable,
                soc_low_enable: soc_cfg.low_enable,
                soc_low_disable: soc_cfg.low_disable,
                start_hour: config.schedule.start_hour,
                end_hour: config.schedule.end_hour,
            },
            protections: ProtectionThresholds {
                high_protect_v: profile.pack.high_protect,
                high_soc_percent: soc_cfg.high_protect,
                emergency_v: profile.pack.emergency,
            },
            tz,
        })
    }

    pub fn snapshot(&self, now: Instant) -> ControllerSnapshot {
        let profile = self.profile_cache.as_ref().map(|(_, p)| p);
        ControllerSnapshot {
            state: self.state.name(),
            grid_on: self.state.actuator_on(),
            reason: self.last_reason.clone(),
            pending_disable_remaining_s: match self.state {
                DecisionState::PendingDisable(deadline) => {
                    Some(deadline.saturating_duration_since(now).as_secs_f64())
                }
                _ => None,
            },
            soc: self.last_soc,
            capacity_kwh: profile.map(|p| p.capacity_kwh),
            chemistry: profile.map(|p| p.chemistry.to_string()),
            cell_count: profile.map(|p| p.cell_count),
            conditions: ConditionFlags {
                load: self.conditions.load.is_enabled(),
                voltage: self.conditions.voltage.is_enabled(),
                soc: self.conditions.soc.is_enabled(),
                time: self.conditions.time_enabled(),
            },
            protections: ProtectionFlags {
                standard: self.protections.standard().is_active(),
                emergency: self.protections.emergency().is_active(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::Chemistry;
    use crate::error::TalosError;
    use chrono::TimeZone;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.battery.chemistry = Chemistry::Ncm;
        config.battery.cell_count = 15;
        config.battery.capacity_ah = Some(280.0);
        config.timezone = "UTC".to_string();
        config
    }

    fn sample(voltage: f64, ac_load: f64, charge_power: f64) -> Sample {
        Sample {
            voltage,
            ac_load,
            charge_power,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
        }
    }

    /// Drive an idle controller through grace and pending disconnect so it
    /// ends up at GridOff. 55.5 V resting on a 15S NCM pack sits in every
    /// dead or release zone.
    fn disconnect(controller: &mut Controller, config: &Config, t0: Instant) -> Instant {
        let idle = sample(55.5, 0.0, 0.0);
        assert!(controller.evaluate(config, &idle, t0).unwrap().is_none());
        assert!(
            controller
                .evaluate(config, &idle, t0 + STARTUP_GRACE)
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            controller.state(),
            DecisionState::PendingDisable(_)
        ));
        let t_off = t0 + STARTUP_GRACE + DISABLE_DELAY;
        let cmd = controller.evaluate(config, &idle, t_off).unwrap().unwrap();
        assert!(!cmd.on);
        assert_eq!(controller.state(), DecisionState::GridOff);
        t_off
    }

    #[test]
    fn starts_grid_on_with_startup_command() {
        let controller = Controller::new(Instant::now());
        assert_eq!(controller.state(), DecisionState::GridOn);
        let cmd = controller.startup_command();
        assert!(cmd.on);
        assert_eq!(cmd.reason, "grid on: startup default");
    }

    #[test]
    fn grace_window_defers_the_first_disconnect() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);
        let idle = sample(55.5, 0.0, 0.0);

        let just_before = t0 + STARTUP_GRACE - Duration::from_millis(100);
        controller.evaluate(&config, &idle, just_before).unwrap();
        assert_eq!(controller.state(), DecisionState::GridOn);

        controller.evaluate(&config, &idle, t0 + STARTUP_GRACE).unwrap();
        assert!(matches!(
            controller.state(),
            DecisionState::PendingDisable(_)
        ));
    }

    #[test]
    fn low_pack_reconnects_citing_voltage_and_soc() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);
        let t_off = disconnect(&mut controller, &config, t0);

        // 50.0 V resting is 3.333 V/cell: below the 3.39 V/cell enable
        // threshold and an estimated SoC around 8 percent
        let low = sample(50.0, 0.0, 0.0);
        let t1 = t_off + Duration::from_secs(1);
        assert!(controller.evaluate(&config, &low, t1).unwrap().is_none());
        assert_eq!(controller.state(), DecisionState::GridOff);

        let cmd = controller
            .evaluate(&config, &low, t1 + Duration::from_secs(3))
            .unwrap()
            .unwrap();
        assert!(cmd.on);
        assert_eq!(cmd.reason, "grid on: conditions active: voltage, soc");
        assert_eq!(controller.state(), DecisionState::GridOn);
    }

    #[test]
    fn emergency_trips_at_exact_pack_maximum_and_beats_load_override() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);

        // Hold a 2600 W load past the debounce so the load condition is up
        let loaded = sample(55.5, 2600.0, 0.0);
        controller.evaluate(&config, &loaded, t0).unwrap();
        controller
            .evaluate(&config, &loaded, t0 + Duration::from_millis(3100))
            .unwrap();
        assert!(controller.conditions().load.is_enabled());

        // 63.0 V is exactly 15 * 4.20 V: emergency trips on the boundary
        // and the load override does not apply to it
        let cmd = controller
            .evaluate(
                &config,
                &sample(63.0, 2600.0, 0.0),
                t0 + Duration::from_secs(4),
            )
            .unwrap()
            .unwrap();
        assert!(!cmd.on);
        assert_eq!(cmd.reason, "grid off: emergency voltage protection active");
        assert_eq!(controller.state(), DecisionState::GridOff);
    }

    #[test]
    fn load_condition_overrides_standard_protection() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);

        let loaded = sample(55.5, 2600.0, 0.0);
        controller.evaluate(&config, &loaded, t0).unwrap();
        controller
            .evaluate(&config, &loaded, t0 + Duration::from_secs(3))
            .unwrap();
        assert!(controller.conditions().load.is_enabled());

        // 62.0 V is above standard protect (61.5) but below emergency:
        // the active load keeps the grid connected
        let hot = sample(62.0, 2600.0, 0.0);
        let t1 = t0 + Duration::from_secs(4);
        assert!(controller.evaluate(&config, &hot, t1).unwrap().is_none());
        assert_eq!(controller.state(), DecisionState::GridOn);
        assert!(controller.protections().standard().is_active());

        // The moment the load releases the protection takes effect
        let unloaded = sample(62.0, 100.0, 0.0);
        let cmd = controller
            .evaluate(&config, &unloaded, t1 + Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(!cmd.on);
        assert_eq!(cmd.reason, "grid off: high protection active");
    }

    #[test]
    fn reconnect_under_standard_protection_names_the_override() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);

        // Trip standard protection with no conditions: grid goes off
        let hot = sample(62.0, 0.0, 0.0);
        let cmd = controller.evaluate(&config, &hot, t0).unwrap().unwrap();
        assert!(!cmd.on);

        // Load comes up and rides through the debounce while still hot
        let hot_loaded = sample(62.0, 2600.0, 0.0);
        let t1 = t0 + Duration::from_secs(1);
        controller.evaluate(&config, &hot_loaded, t1).unwrap();
        let cmd = controller
            .evaluate(&config, &hot_loaded, t1 + Duration::from_secs(3))
            .unwrap()
            .unwrap();
        assert!(cmd.on);
        assert_eq!(
            cmd.reason,
            "grid on: conditions active: load (load overrides high protection)"
        );
    }

    #[test]
    fn missing_capacity_fails_closed_every_cycle() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.battery.capacity_ah = None;
        let mut controller = Controller::new(t0);

        for i in 0..3 {
            let result = controller.evaluate(
                &config,
                &sample(50.0, 0.0, 0.0),
                t0 + Duration::from_secs(i),
            );
            assert!(matches!(result, Err(TalosError::Config { .. })));
            assert_eq!(controller.state(), DecisionState::GridOn);
        }
    }

    #[test]
    fn pending_disconnect_waits_the_full_delay() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);
        let idle = sample(55.5, 0.0, 0.0);

        controller.evaluate(&config, &idle, t0).unwrap();
        controller.evaluate(&config, &idle, t0 + STARTUP_GRACE).unwrap();
        let deadline = match controller.state() {
            DecisionState::PendingDisable(d) => d,
            other => panic!("expected pending disable, got {other:?}"),
        };
        assert_eq!(deadline, t0 + STARTUP_GRACE + DISABLE_DELAY);
        assert_eq!(controller.next_deadline(), Some(deadline));

        // Just short of the deadline nothing happens
        assert!(
            controller
                .evaluate(&config, &idle, deadline - Duration::from_millis(100))
                .unwrap()
                .is_none()
        );

        let cmd = controller.evaluate(&config, &idle, deadline).unwrap().unwrap();
        assert!(!cmd.on);
        assert_eq!(cmd.reason, "grid off: no conditions active");
    }

    #[test]
    fn condition_returning_cancels_pending_disconnect() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);
        let idle = sample(55.5, 0.0, 0.0);

        controller.evaluate(&config, &idle, t0).unwrap();
        controller.evaluate(&config, &idle, t0 + STARTUP_GRACE).unwrap();
        assert!(matches!(
            controller.state(),
            DecisionState::PendingDisable(_)
        ));

        // Voltage drops low and holds through its debounce before the
        // disconnect deadline
        let low = sample(50.0, 0.0, 0.0);
        let t1 = t0 + STARTUP_GRACE + Duration::from_secs(5);
        controller.evaluate(&config, &low, t1).unwrap();
        let out = controller
            .evaluate(&config, &low, t1 + Duration::from_secs(3))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(controller.state(), DecisionState::GridOn);

        // The old deadline is gone with the state it lived in
        let t_past_deadline = t0 + STARTUP_GRACE + DISABLE_DELAY + Duration::from_secs(1);
        assert!(
            controller
                .evaluate(&config, &low, t_past_deadline)
                .unwrap()
                .is_none()
        );
        assert_eq!(controller.state(), DecisionState::GridOn);
    }

    #[test]
    fn implausible_samples_are_dropped_and_state_held() {
        let t0 = Instant::now();
        let config = test_config();
        let mut controller = Controller::new(t0);

        for bad in [
            sample(120.0, 0.0, 0.0),
            sample(-1.0, 0.0, 0.0),
            sample(55.5, 60_000.0, 0.0),
            sample(55.5, -5.0, 0.0),
            sample(f64::NAN, 0.0, 0.0),
        ] {
            let out = controller.evaluate(&config, &bad, t0).unwrap();
            assert!(out.is_none());
            assert_eq!(controller.state(), DecisionState::GridOn);
        }
    }

    #[test]
    fn sample_validity_boundaries() {
        assert!(sample(0.0, 0.0, 0.0).validity_error().is_none());
        assert!(sample(100.0, 50_000.0, -3000.0).validity_error().is_none());
        assert!(sample(100.1, 0.0, 0.0).validity_error().is_some());
        assert!(sample(50.0, 50_000.1, 0.0).validity_error().is_some());
    }

    #[test]
    fn misordered_load_thresholds_revert_to_defaults() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.load.enable_watts = 100.0;
        config.load.disable_watts = 500.0;
        let mut controller = Controller::new(t0);

        // 2600 W clears the default 2500 W enable threshold
        let loaded = sample(55.5, 2600.0, 0.0);
        controller.evaluate(&config, &loaded, t0).unwrap();
        controller
            .evaluate(&config, &loaded, t0 + Duration::from_secs(3))
            .unwrap();
        assert!(controller.conditions().load.is_enabled());

        // 200 W is inside the reverted dead zone floor (300 W): release
        let light = sample(55.5, 200.0, 0.0);
        controller
            .evaluate(&config, &light, t0 + Duration::from_secs(4))
            .unwrap();
        assert!(!controller.conditions().load.is_enabled());
    }

    #[test]
    fn soc_disable_may_equal_the_protect_threshold() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.soc.low_enable = 50.0;
        config.soc.low_disable = 97.0;
        config.soc.high_protect = 97.0;
        let mut controller = Controller::new(t0);

        // 54.8 V resting reads about 33 percent: below the configured
        // 50 percent enable but above the default 20, so a silent revert
        // to defaults would keep this condition down
        let mid = sample(54.8, 0.0, 0.0);
        controller.evaluate(&config, &mid, t0).unwrap();
        controller
            .evaluate(&config, &mid, t0 + Duration::from_secs(3))
            .unwrap();
        assert!(controller.conditions().soc.is_enabled());
    }

    #[test]
    fn misordered_soc_thresholds_revert_to_defaults() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.soc.low_enable = 60.0;
        config.soc.low_disable = 40.0;
        let mut controller = Controller::new(t0);

        // 33 percent would trigger the broken 60 percent enable but not
        // the default 20 the group reverts to
        let mid = sample(54.8, 0.0, 0.0);
        controller.evaluate(&config, &mid, t0).unwrap();
        controller
            .evaluate(&config, &mid, t0 + Duration::from_secs(3))
            .unwrap();
        assert!(!controller.conditions().soc.is_enabled());
    }

    #[test]
    fn unknown_timezone_falls_back_without_failing() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.timezone = "Not/AZone".to_string();
        let mut controller = Controller::new(t0);
        let out = controller.evaluate(&config, &sample(55.5, 0.0, 0.0), t0);
        assert!(out.is_ok());
    }

    #[test]
    fn battery_profile_is_recomputed_when_the_config_changes() {
        let t0 = Instant::now();
        let mut config = test_config();
        let mut controller = Controller::new(t0);

        controller.evaluate(&config, &sample(55.5, 0.0, 0.0), t0).unwrap();
        let kwh_15s = controller.snapshot(t0).capacity_kwh.unwrap();
        assert!((kwh_15s - 15.54).abs() < 1e-9);

        config.battery.cell_count = 16;
        let t1 = t0 + Duration::from_secs(1);
        controller
            .evaluate(&config, &sample(55.5, 0.0, 0.0), t1)
            .unwrap();
        let kwh_16s = controller.snapshot(t1).capacity_kwh.unwrap();
        assert!((kwh_16s - 16.576).abs() < 1e-9);
    }

    #[test]
    fn schedule_window_connects_and_disconnects_on_the_hour() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.schedule.start_hour = 11;
        config.schedule.end_hour = 13;
        let mut controller = Controller::new(t0);
        let t_off = disconnect_with_hour(&mut controller, &config, t0, 9);

        // Sample timestamps at 12:00 local fall inside [11, 13)
        let inside = sample(55.5, 0.0, 0.0);
        let cmd = controller
            .evaluate(&config, &inside, t_off + Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(cmd.on);
        assert_eq!(cmd.reason, "grid on: conditions active: time");

        // At 13:00 the window closes and the pending disconnect arms
        let outside = Sample {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 13, 0, 0).unwrap(),
            ..inside
        };
        controller
            .evaluate(&config, &outside, t_off + Duration::from_secs(2))
            .unwrap();
        assert!(matches!(
            controller.state(),
            DecisionState::PendingDisable(_)
        ));
    }

    /// Same as `disconnect` but with the sample clock pinned to a given
    /// UTC hour so schedule tests control window membership.
    fn disconnect_with_hour(
        controller: &mut Controller,
        config: &Config,
        t0: Instant,
        hour: u32,
    ) -> Instant {
        let idle = Sample {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, hour, 0, 0).unwrap(),
            ..sample(55.5, 0.0, 0.0)
        };
        controller.evaluate(config, &idle, t0).unwrap();
        controller.evaluate(config, &idle, t0 + STARTUP_GRACE).unwrap();
        let t_off = t0 + STARTUP_GRACE + DISABLE_DELAY;
        let cmd = controller.evaluate(config, &idle, t_off).unwrap().unwrap();
        assert!(!cmd.on);
        t_off
    }
}
