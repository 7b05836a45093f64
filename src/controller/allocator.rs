//! Splits the PID budget across loads in configuration order.
//!
//! Allocation is sequential: each auto load takes `round(remaining * ratio)`,
//! clamped to its own capacity and limit, and the next load only sees what is
//! left. Standby and bypass loads do not consume budget.

use tracing::{error, info};

use crate::controller::firing::FiringDelayTable;
use crate::domain::{Load, LoadMetrics, LoadMode};

#[derive(Debug, Clone, Copy)]
pub struct LoadAllocator {
    table: FiringDelayTable,
}

impl LoadAllocator {
    pub fn new(table: FiringDelayTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &FiringDelayTable {
        &self.table
    }

    /// Recompute every load's metrics for this cycle. Returns the budget left
    /// over after all auto loads took their share (may be negative).
    pub fn allocate(&self, budget_w: f64, voltage_v: f64, loads: &mut [Load]) -> f64 {
        let mut remaining = budget_w;

        for load in loads.iter_mut() {
            load.fault = None;
            match self.allocate_one(remaining, voltage_v, load) {
                Ok(taken) => {
                    remaining -= taken;
                    info!(
                        load = %load.spec.name,
                        power_w = load.metrics.power_to_divert_w.round(),
                        duty_percent = (load.metrics.duty_cycle * 100.0).round(),
                        "allocated"
                    );
                }
                Err(reason) => {
                    error!(load = %load.spec.name, %reason, "allocation skipped");
                    load.metrics = LoadMetrics::default();
                    load.fault = Some(reason);
                }
            }
        }

        remaining
    }

    /// Fill in one load's metrics, returning the budget it consumed.
    fn allocate_one(
        &self,
        remaining: f64,
        voltage_v: f64,
        load: &mut Load,
    ) -> Result<f64, String> {
        let spec = &load.spec;
        let max_power = voltage_v * voltage_v / spec.resistance_ohms;
        if !max_power.is_finite() || max_power < 0.0 {
            return Err(format!(
                "max power is not a number ({voltage_v} V, {} ohm)",
                spec.resistance_ohms
            ));
        }

        let (power, taken) = match load.mode {
            LoadMode::Standby => (0.0, 0.0),
            LoadMode::Bypass { .. } => (max_power, 0.0),
            LoadMode::Auto => {
                let mut share = (remaining * spec.power_ratio).round();
                if !share.is_finite() {
                    return Err(format!("power share is not a number ({remaining} W budget)"));
                }
                share = share.clamp(0.0, max_power);
                if spec.power_limit_w > 0.0 {
                    share = share.min(spec.power_limit_w);
                }
                (share, share)
            }
        };

        let duty_cycle = if max_power == 0.0 {
            0.0
        } else {
            (power / max_power).clamp(0.0, 1.0)
        };
        if duty_cycle.is_nan() {
            return Err("duty cycle is not a number".to_string());
        }

        let power_factor = duty_cycle.sqrt();
        let effective_voltage = power_factor * voltage_v;
        let current = effective_voltage / spec.resistance_ohms;
        let thdi = if load.mode.is_bypass() || duty_cycle == 0.0 {
            0.0
        } else {
            (1.0 / duty_cycle - 1.0).sqrt()
        };

        load.metrics = LoadMetrics {
            max_power_w: max_power,
            power_to_divert_w: power,
            duty_cycle,
            firing_delay_us: self.table.lookup(duty_cycle),
            power_factor,
            effective_voltage_v: effective_voltage,
            current_a: current,
            apparent_power_va: current * voltage_v,
            thdi,
        };

        Ok(taken)
    }
}
