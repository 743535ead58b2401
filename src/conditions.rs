//! Debounced, hysteretic grid-enable conditions
//!
//! Load, voltage and SoC are three-zone conditions: a trigger zone that
//! arms a 3-second debounce, a release zone that disables immediately, and
//! a dead zone between the two thresholds where a pending timer is
//! cancelled but a settled state is held. The schedule condition is a pure
//! level signal with no debounce.
//!
//! The asymmetry is deliberate: slow to confirm a transient spike on the
//! way up, immediate on the way down.

use crate::logging::{StructuredLogger, get_logger};
use std::time::{Duration, Instant};

/// Hold time a trigger must persist before a condition enables
pub const ENABLE_DEBOUNCE: Duration = Duration::from_secs(3);

/// Where a reading sits relative to a condition's threshold pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Trigger,
    Dead,
    Release,
}

/// Classify a reading that triggers above `enable` and releases below
/// `disable` (the load condition). Values in [disable, enable] are dead.
pub fn zone_above(value: f64, enable: f64, disable: f64) -> Zone {
    if value > enable {
        Zone::Trigger
    } else if value < disable {
        Zone::Release
    } else {
        Zone::Dead
    }
}

/// Classify a reading that triggers below `enable` and releases above
/// `disable` (voltage and SoC). Values in [enable, disable] are dead.
pub fn zone_below(value: f64, enable: f64, disable: f64) -> Zone {
    if value < enable {
        Zone::Trigger
    } else if value > disable {
        Zone::Release
    } else {
        Zone::Dead
    }
}

/// Half-open local-hour membership test for the schedule window.
/// `start == end` disables the window; `start > end` wraps past midnight.
pub fn hour_in_window(hour: u32, start_hour: u8, end_hour: u8) -> bool {
    let start = u32::from(start_hour);
    let end = u32::from(end_hour);
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// State of one debounced condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    Idle,
    PendingEnable(Instant),
    Enabled,
}

/// One debounced condition state machine
#[derive(Debug, Clone)]
pub struct DebouncedCondition {
    name: &'static str,
    state: ConditionState,
}

impl DebouncedCondition {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: ConditionState::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConditionState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ConditionState::Enabled)
    }

    /// Deadline of a running debounce timer, if any
    pub fn pending_deadline(&self) -> Option<Instant> {
        match self.state {
            ConditionState::PendingEnable(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// Advance the state machine with the current zone classification.
    /// A debounce that is cancelled restarts from zero on the next trigger.
    pub fn apply(&mut self, zone: Zone, now: Instant) {
        self.state = match (self.state, zone) {
            (ConditionState::Idle, Zone::Trigger) => {
                ConditionState::PendingEnable(now + ENABLE_DEBOUNCE)
            }
            (ConditionState::Idle, _) => ConditionState::Idle,
            (ConditionState::PendingEnable(deadline), Zone::Trigger) => {
                if now >= deadline {
                    ConditionState::Enabled
                } else {
                    ConditionState::PendingEnable(deadline)
                }
            }
            // Dead or release zone before the deadline: cancel, no credit
            (ConditionState::PendingEnable(_), _) => ConditionState::Idle,
            // Release is immediate, trigger and dead zone hold the latch
            (ConditionState::Enabled, Zone::Release) => ConditionState::Idle,
            (ConditionState::Enabled, _) => ConditionState::Enabled,
        };
    }
}

/// Threshold bundle consumed by the condition set each cycle
#[derive(Debug, Clone, Copy)]
pub struct ConditionThresholds {
    pub load_enable_w: f64,
    pub load_disable_w: f64,
    pub voltage_low_enable: f64,
    pub voltage_low_disable: f64,
    pub soc_low_enable: f64,
    pub soc_low_disable: f64,
    pub start_hour: u8,
    pub end_hour: u8,
}

/// The four independent grid-enable conditions
pub struct ConditionSet {
    pub load: DebouncedCondition,
    pub voltage: DebouncedCondition,
    pub soc: DebouncedCondition,
    time_enabled: bool,
    logger: StructuredLogger,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self {
            load: DebouncedCondition::new("load"),
            voltage: DebouncedCondition::new("voltage"),
            soc: DebouncedCondition::new("soc"),
            time_enabled: false,
            logger: get_logger("conditions"),
        }
    }

    /// Evaluate all four conditions against the current readings
    pub fn evaluate(
        &mut self,
        ac_load_w: f64,
        pack_voltage: f64,
        soc_percent: f64,
        th: &ConditionThresholds,
        local_hour: u32,
        now: Instant,
    ) {
        let before = [
            self.load.state(),
            self.voltage.state(),
            self.soc.state(),
        ];

        self.load
            .apply(zone_above(ac_load_w, th.load_enable_w, th.load_disable_w), now);
        self.voltage.apply(
            zone_below(pack_voltage, th.voltage_low_enable, th.voltage_low_disable),
            now,
        );
        self.soc.apply(
            zone_below(soc_percent, th.soc_low_enable, th.soc_low_disable),
            now,
        );

        for (prev, cond) in before
            .iter()
            .zip([&self.load, &self.voltage, &self.soc])
        {
            if *prev != cond.state() {
                match cond.state() {
                    ConditionState::Enabled => {
                        self.logger
                            .info(&format!("Condition '{}' enabled", cond.name()));
                    }
                    ConditionState::PendingEnable(_) => {
                        self.logger
                            .debug(&format!("Condition '{}' pending enable", cond.name()));
                    }
                    ConditionState::Idle => {
                        if matches!(prev, ConditionState::Enabled) {
                            self.logger
                                .info(&format!("Condition '{}' released", cond.name()));
                        } else {
                            self.logger.debug(&format!(
                                "Condition '{}' debounce cancelled",
                                cond.name()
                            ));
                        }
                    }
                }
            }
        }

        let time_now = hour_in_window(local_hour, th.start_hour, th.end_hour);
        if time_now != self.time_enabled {
            self.logger.info(&format!(
                "Condition 'time' {} (hour {} in {}..{})",
                if time_now { "enabled" } else { "released" },
                local_hour,
                th.start_hour,
                th.end_hour
            ));
        }
        self.time_enabled = time_now;
    }

    pub fn time_enabled(&self) -> bool {
        self.time_enabled
    }

    /// True when any of the four conditions is enabled
    pub fn any_enabled(&self) -> bool {
        self.load.is_enabled()
            || self.voltage.is_enabled()
            || self.soc.is_enabled()
            || self.time_enabled
    }

    /// Names of the currently enabled conditions, in fixed order
    pub fn active_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.load.is_enabled() {
            names.push("load");
        }
        if self.voltage.is_enabled() {
            names.push("voltage");
        }
        if self.soc.is_enabled() {
            names.push("soc");
        }
        if self.time_enabled {
            names.push("time");
        }
        names
    }

    /// Earliest running debounce deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        [&self.load, &self.voltage, &self.soc]
            .iter()
            .filter_map(|c| c.pending_deadline())
            .min()
    }
}

impl Default for ConditionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries_are_dead() {
        // Strict comparisons: a value exactly at a threshold is dead
        assert_eq!(zone_above(2500.0, 2500.0, 300.0), Zone::Dead);
        assert_eq!(zone_above(2500.1, 2500.0, 300.0), Zone::Trigger);
        assert_eq!(zone_above(300.0, 2500.0, 300.0), Zone::Dead);
        assert_eq!(zone_above(299.9, 2500.0, 300.0), Zone::Release);

        assert_eq!(zone_below(50.85, 50.85, 53.1), Zone::Dead);
        assert_eq!(zone_below(50.84, 50.85, 53.1), Zone::Trigger);
        assert_eq!(zone_below(53.1, 50.85, 53.1), Zone::Dead);
        assert_eq!(zone_below(53.2, 50.85, 53.1), Zone::Release);
    }

    #[test]
    fn short_breach_never_enables() {
        let t0 = Instant::now();
        let mut cond = DebouncedCondition::new("load");
        cond.apply(Zone::Trigger, t0);
        cond.apply(Zone::Trigger, t0 + Duration::from_millis(2999));
        assert!(!cond.is_enabled());
    }

    #[test]
    fn breach_at_exactly_three_seconds_enables() {
        let t0 = Instant::now();
        let mut cond = DebouncedCondition::new("load");
        cond.apply(Zone::Trigger, t0);
        cond.apply(Zone::Trigger, t0 + Duration::from_secs(3));
        assert!(cond.is_enabled());
    }

    #[test]
    fn dead_zone_cancels_pending_and_debounce_restarts() {
        let t0 = Instant::now();
        let mut cond = DebouncedCondition::new("voltage");
        cond.apply(Zone::Trigger, t0);
        assert!(cond.pending_deadline().is_some());

        // Retreat into the dead zone before the deadline: back to Idle
        cond.apply(Zone::Dead, t0 + Duration::from_secs(1));
        assert_eq!(cond.state(), ConditionState::Idle);

        // Re-trigger: no partial credit, full 3 seconds again
        let t1 = t0 + Duration::from_secs(2);
        cond.apply(Zone::Trigger, t1);
        cond.apply(Zone::Trigger, t1 + Duration::from_millis(2900));
        assert!(!cond.is_enabled());
        cond.apply(Zone::Trigger, t1 + Duration::from_secs(3));
        assert!(cond.is_enabled());
    }

    #[test]
    fn release_is_immediate_and_dead_zone_holds_enabled() {
        let t0 = Instant::now();
        let mut cond = DebouncedCondition::new("soc");
        cond.apply(Zone::Trigger, t0);
        cond.apply(Zone::Trigger, t0 + Duration::from_secs(3));
        assert!(cond.is_enabled());

        // Dead zone keeps the settled state
        cond.apply(Zone::Dead, t0 + Duration::from_secs(4));
        assert!(cond.is_enabled());

        // Release drops it without any debounce
        cond.apply(Zone::Release, t0 + Duration::from_secs(5));
        assert_eq!(cond.state(), ConditionState::Idle);
    }

    #[test]
    fn hour_window_membership() {
        // Plain window [1, 5)
        assert!(!hour_in_window(0, 1, 5));
        assert!(hour_in_window(1, 1, 5));
        assert!(hour_in_window(4, 1, 5));
        assert!(!hour_in_window(5, 1, 5));

        // Overnight window [23, 6)
        assert!(hour_in_window(23, 23, 6));
        assert!(hour_in_window(0, 23, 6));
        assert!(hour_in_window(5, 23, 6));
        assert!(!hour_in_window(6, 23, 6));
        assert!(!hour_in_window(12, 23, 6));

        // Equal hours disable the window
        assert!(!hour_in_window(0, 0, 0));
        assert!(!hour_in_window(13, 13, 13));
    }

    #[test]
    fn condition_set_tracks_active_names_and_deadlines() {
        let t0 = Instant::now();
        let th = ConditionThresholds {
            load_enable_w: 2500.0,
            load_disable_w: 300.0,
            voltage_low_enable: 50.85,
            voltage_low_disable: 53.1,
            soc_low_enable: 20.0,
            soc_low_disable: 30.0,
            start_hour: 1,
            end_hour: 5,
        };
        let mut set = ConditionSet::new();

        // Load and voltage trigger, soc in release zone, hour outside window
        set.evaluate(3000.0, 50.0, 50.0, &th, 12, t0);
        assert!(!set.any_enabled());
        assert_eq!(set.next_deadline(), Some(t0 + ENABLE_DEBOUNCE));

        // After the debounce both flip enabled; schedule joins in-window
        let t1 = t0 + Duration::from_secs(3);
        set.evaluate(3000.0, 50.0, 50.0, &th, 2, t1);
        assert!(set.any_enabled());
        assert_eq!(set.active_names(), vec!["load", "voltage", "time"]);
        assert!(set.next_deadline().is_none());
    }
}
