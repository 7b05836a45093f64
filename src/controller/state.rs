use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{BypassMode, Config, GridSource};
use crate::controller::dispatch::DispatchReport;
use crate::controller::pid::{
    DerivativeMode, GainSchedule, GainSet, IntegralCorrection, PidController, PidTerms,
    ProportionalMode, Tuning,
};
use crate::domain::{
    DimmerCommand, GridReading, Load, LoadMetrics, LoadMode, LoadSpec, RpcOutcome,
};

/// Counters kept across cycles, reset only with the process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    /// Ticks that fired while a cycle was still running
    pub dropped_ticks: u64,
    pub telemetry_failures: u64,
    pub override_failures: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_dispatch: DispatchReport,
}

/// Everything the control loop mutates. Owned by the loop task alone.
#[derive(Debug)]
pub struct ControllerState {
    pub config: Arc<Config>,
    pub debug: u8,
    pub pid: PidController,
    pub schedule: GainSchedule,
    pub active_gains: GainSet,
    pub loads: Vec<Load>,
    pub grid: Option<GridReading>,
    /// Last observed bypass switch position, `None` until first read
    pub bypass_switch: Option<bool>,
    pub stats: CycleStats,
}

impl ControllerState {
    pub fn new(config: Arc<Config>) -> Self {
        let pid_cfg = &config.pid;
        let pid = PidController::new(pid_cfg.setpoint, pid_cfg.high)
            .with_modes(
                pid_cfg.proportional_mode,
                pid_cfg.derivative_mode,
                pid_cfg.integral_correction,
            )
            .reversed(pid_cfg.reverse);
        let schedule = GainSchedule {
            high: pid_cfg.high,
            low: pid_cfg.low,
            switch_threshold: pid_cfg.high_low_switch,
        };
        let loads = config
            .enabled_loads()
            .map(|l| Load::new(LoadSpec::from(l)))
            .collect();

        Self {
            debug: config.debug,
            pid,
            schedule,
            active_gains: GainSet::High,
            loads,
            grid: None,
            bypass_switch: None,
            stats: CycleStats::default(),
            config,
        }
    }

    pub fn load_mut(&mut self, name: &str) -> Option<&mut Load> {
        self.loads.iter_mut().find(|l| l.spec.name == name)
    }

    /// Back to the startup state, keeping live-tuned parameters.
    pub fn reset(&mut self) {
        self.pid.reset();
        for load in &mut self.loads {
            load.reset();
        }
        self.grid = None;
        self.bypass_switch = None;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            config: ConfigStatus {
                debug: self.debug,
                grid_source: self.config.grid.source,
                nominal_voltage: self.config.grid.nominal_voltage,
                semi_period_us: self.config.grid.semi_period_us,
                tick_ms: self.config.control.tick_ms,
                bypass_mode: self.config.bypass.mode,
                proportional_mode: self.config.pid.proportional_mode,
                derivative_mode: self.config.pid.derivative_mode,
                integral_correction: self.config.pid.integral_correction,
                reverse: self.config.pid.reverse,
                schedule: self.schedule.clone(),
            },
            pid: PidStatus {
                setpoint: self.pid.setpoint(),
                gains: self.active_gains,
                tuning: self.pid.tuning(),
                terms: self.pid.terms(),
            },
            grid: self.grid,
            bypass_switch: self.bypass_switch,
            loads: self.loads.iter().map(LoadStatus::from).collect(),
            stats: self.stats.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub debug: u8,
    pub grid_source: GridSource,
    pub nominal_voltage: f64,
    pub semi_period_us: u32,
    pub tick_ms: u64,
    pub bypass_mode: BypassMode,
    pub proportional_mode: ProportionalMode,
    pub derivative_mode: DerivativeMode,
    pub integral_correction: IntegralCorrection,
    pub reverse: bool,
    pub schedule: GainSchedule,
}

#[derive(Debug, Clone, Serialize)]
pub struct PidStatus {
    pub setpoint: f64,
    pub gains: GainSet,
    pub tuning: Tuning,
    #[serde(flatten)]
    pub terms: PidTerms,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadStatus {
    #[serde(flatten)]
    pub spec: LoadSpec,
    #[serde(flatten)]
    pub mode: LoadMode,
    #[serde(flatten)]
    pub metrics: LoadMetrics,
    pub relay_on: bool,
    pub brightness: u8,
    pub outcome: RpcOutcome,
    pub last_sent: Option<DimmerCommand>,
    pub fault: Option<String>,
}

impl From<&Load> for LoadStatus {
    fn from(load: &Load) -> Self {
        Self {
            spec: load.spec.clone(),
            mode: load.mode,
            metrics: load.metrics,
            relay_on: load.dispatch.relay_on,
            brightness: load.dispatch.brightness,
            outcome: load.dispatch.outcome,
            last_sent: load.dispatch.last_sent.clone(),
            fault: load.fault.clone(),
        }
    }
}

/// Read-only view published after every cycle and administrative command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub config: ConfigStatus,
    pub pid: PidStatus,
    pub grid: Option<GridReading>,
    pub bypass_switch: Option<bool>,
    pub loads: Vec<LoadStatus>,
    pub stats: CycleStats,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use figment::{providers::Format, providers::Toml, Figment};

    pub(crate) fn config_with_loads(names: &[&str]) -> Config {
        let mut toml = String::from(
            r#"
            [server]
            host = "127.0.0.1"
            port = 8080

            [grid]
            source = "feed"

            [pid]
            setpoint = -100.0
            high_low_switch = 150.0

            [pid.high]
            kp = 0.2
            ki = 0.4
            kd = 0.02
            out_min = -300.0
            out_max = 3000.0

            [pid.low]
            kp = 0.1
            ki = 0.2
            kd = 0.0
            out_min = -300.0
            out_max = 3000.0
            "#,
        );
        for (i, name) in names.iter().enumerate() {
            toml.push_str(&format!(
                "\n[[loads]]\nname = \"{name}\"\naddress = \"192.168.1.{}\"\nresistance = 85.0\n",
                30 + i
            ));
        }
        Config::from_figment(Figment::new().merge(Toml::string(&toml))).expect("valid test config")
    }

    pub(crate) fn state_with_loads(names: &[&str]) -> ControllerState {
        ControllerState::new(Arc::new(config_with_loads(names)))
    }

    #[test]
    fn test_loads_follow_configuration_order() {
        let state = state_with_loads(&["boiler", "pool", "towel"]);
        let names: Vec<_> = state.loads.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["boiler", "pool", "towel"]);
        assert!(state.schedule.low.is_some());
    }

    #[test]
    fn test_disabled_load_is_not_instantiated() {
        let mut cfg = config_with_loads(&["boiler", "pool"]);
        cfg.loads[1].resistance = 0.0;
        let state = ControllerState::new(Arc::new(cfg));
        assert_eq!(state.loads.len(), 1);
    }

    #[test]
    fn test_reset_returns_to_first_sample() {
        let mut state = state_with_loads(&["boiler"]);
        state.pid.update(200.0);
        state.loads[0].set_standby();
        state.bypass_switch = Some(true);
        state.reset();
        assert_eq!(state.pid.terms(), PidTerms::default());
        assert_eq!(state.loads[0].mode, LoadMode::Auto);
        assert!(state.bypass_switch.is_none());
    }

    #[test]
    fn test_snapshot_serializes_flat_load_entries() {
        let mut state = state_with_loads(&["boiler"]);
        state.loads[0].engage_bypass();
        let json = serde_json::to_value(state.snapshot()).unwrap();
        let load = &json["loads"][0];
        assert_eq!(load["name"], "boiler");
        assert_eq!(load["mode"], "bypass");
        assert_eq!(load["resume"], "auto");
        assert_eq!(load["turn_off_delay_ms"], 300_000);
        assert_eq!(load["outcome"], "skipped");
        assert_eq!(json["pid"]["setpoint"], -100.0);
        assert_eq!(json["config"]["grid_source"], "feed");
    }
}
