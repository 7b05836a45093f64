//! Dimmer percentage and relay on/off decision per load.
//!
//! The dimmer's internal relay has a finite contact life, so a load sitting at
//! its minimum percentage keeps the relay closed for `turn_off_delay` after it
//! was last above the minimum before it is allowed to open.

use tokio::time::Instant;

use crate::config::BypassMode;
use crate::controller::firing::FiringDelayTable;
use crate::domain::{Load, LoadMode};

/// What the dimmer should be told this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDecision {
    pub on: bool,
    pub brightness: u8,
}

impl RelayDecision {
    pub const OFF: Self = Self {
        on: false,
        brightness: 0,
    };
    pub const FULL: Self = Self {
        on: true,
        brightness: 100,
    };
}

#[derive(Debug, Clone, Copy)]
pub struct RelayHysteresis {
    bypass_mode: BypassMode,
    table: FiringDelayTable,
}

impl RelayHysteresis {
    pub fn new(bypass_mode: BypassMode, table: FiringDelayTable) -> Self {
        Self { bypass_mode, table }
    }

    /// Percentage sent to the dimmer for the load's current metrics, rounded
    /// after clamping into `[duty_min, duty_max]`.
    pub fn percentage(&self, load: &Load) -> u8 {
        let fraction = if load.spec.use_phase_lut {
            self.table.conduction(load.metrics.firing_delay_us)
        } else {
            load.metrics.duty_cycle
        };
        let pct = (fraction * 100.0).clamp(
            f64::from(load.spec.duty_min),
            f64::from(load.spec.duty_max),
        );
        pct.round() as u8
    }

    /// Decide the relay state and record it on the load.
    pub fn decide(&self, load: &mut Load, now: Instant) -> RelayDecision {
        let decision = match load.mode {
            LoadMode::Standby => RelayDecision::OFF,
            // the contactor carries the load, the dimmer must stay dark
            LoadMode::Bypass { .. } if self.bypass_mode == BypassMode::Contactor => {
                RelayDecision::OFF
            }
            LoadMode::Bypass { .. } => RelayDecision::FULL,
            LoadMode::Auto => {
                let brightness = self.percentage(load);
                if brightness > load.spec.duty_min {
                    load.dispatch.last_activation = Some(now);
                    RelayDecision {
                        on: true,
                        brightness,
                    }
                } else {
                    let holding = load.dispatch.last_activation.is_some_and(|at| {
                        now.saturating_duration_since(at) < load.spec.turn_off_delay
                    });
                    RelayDecision {
                        on: holding,
                        brightness,
                    }
                }
            }
        };

        load.dispatch.relay_on = decision.on;
        load.dispatch.brightness = decision.brightness;
        decision
    }
}
