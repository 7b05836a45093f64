use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::LoadConfig;
use crate::domain::DimmerCommand;

/// Static constraints of one resistive load, live-tunable between cycles.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSpec {
    pub name: String,
    pub address: String,
    pub resistance_ohms: f64,
    /// Share of the remaining budget this load takes
    pub power_ratio: f64,
    /// 0 = unlimited
    pub power_limit_w: f64,
    /// Dimmer percentage bounds, `duty_min < duty_max <= 100`
    pub duty_min: u8,
    pub duty_max: u8,
    #[serde(rename = "turn_off_delay_ms", serialize_with = "as_millis")]
    pub turn_off_delay: Duration,
    pub use_phase_lut: bool,
}

impl From<&LoadConfig> for LoadSpec {
    fn from(cfg: &LoadConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            resistance_ohms: cfg.resistance,
            power_ratio: cfg.power_ratio,
            power_limit_w: cfg.power_limit,
            duty_min: cfg.duty_min,
            duty_max: cfg.duty_max,
            turn_off_delay: Duration::from_millis(cfg.turn_off_delay_ms),
            use_phase_lut: cfg.use_phase_lut,
        }
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Mode a bypassed load returns to when the bypass is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resume {
    Auto,
    Standby,
}

/// Operating mode. Standby forces 0 power, bypass forces full power, auto
/// takes a share of the PID budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LoadMode {
    #[default]
    Auto,
    Standby,
    Bypass { resume: Resume },
}

impl LoadMode {
    pub fn is_bypass(&self) -> bool {
        matches!(self, LoadMode::Bypass { .. })
    }
}

/// Outcome of the last dispatch attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RpcOutcome {
    Pending,
    Success,
    Failed,
    #[default]
    Skipped,
}

/// Values recomputed by the allocator on every cycle. Everything after
/// `firing_delay_us` is an estimate, never fed back into control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadMetrics {
    pub max_power_w: f64,
    pub power_to_divert_w: f64,
    /// 0..=1
    pub duty_cycle: f64,
    pub firing_delay_us: u32,
    pub power_factor: f64,
    pub effective_voltage_v: f64,
    pub current_a: f64,
    pub apparent_power_va: f64,
    pub thdi: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchRecord {
    /// Last time the dimmer ran above its minimum
    pub last_activation: Option<Instant>,
    pub last_sent: Option<DimmerCommand>,
    pub outcome: RpcOutcome,
    pub relay_on: bool,
    pub brightness: u8,
}

#[derive(Debug, Clone)]
pub struct Load {
    pub spec: LoadSpec,
    pub mode: LoadMode,
    pub metrics: LoadMetrics,
    pub dispatch: DispatchRecord,
    /// Set when this cycle's numbers are unusable; the load is not dispatched
    pub fault: Option<String>,
}

impl Load {
    pub fn new(spec: LoadSpec) -> Self {
        Self {
            spec,
            mode: LoadMode::Auto,
            metrics: LoadMetrics::default(),
            dispatch: DispatchRecord::default(),
            fault: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Enter bypass, remembering the current mode. Returns false if already bypassed.
    pub fn engage_bypass(&mut self) -> bool {
        let resume = match self.mode {
            LoadMode::Bypass { .. } => return false,
            LoadMode::Auto => Resume::Auto,
            LoadMode::Standby => Resume::Standby,
        };
        self.mode = LoadMode::Bypass { resume };
        true
    }

    /// Leave bypass, restoring the saved mode. Returns false if not bypassed.
    pub fn release_bypass(&mut self) -> bool {
        let LoadMode::Bypass { resume } = self.mode else {
            return false;
        };
        self.mode = match resume {
            Resume::Auto => LoadMode::Auto,
            Resume::Standby => LoadMode::Standby,
        };
        true
    }

    pub fn set_auto(&mut self) {
        self.mode = LoadMode::Auto;
    }

    pub fn set_standby(&mut self) {
        self.mode = LoadMode::Standby;
    }

    /// Forget everything computed or sent, keep the spec
    pub fn reset(&mut self) {
        *self = Self::new(self.spec.clone());
    }
}
