use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    net::SocketAddr,
    time::Duration,
};
use thiserror::Error;
use validator::Validate;

use crate::controller::overrides::OverrideRegistry;
use crate::controller::pid::{DerivativeMode, IntegralCorrection, ProportionalMode, Tuning};

/// Fatal configuration problems. Any of these refuses to start the control loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("no load configured")]
    NoLoads,
    #[error("duplicate load name: {0}")]
    DuplicateLoad(String),
    #[error("load {name}: resistance must not be negative (got {value} ohm)")]
    NegativeResistance { name: String, value: f64 },
    #[error("load {name}: duty_min ({min}) must be lower than duty_max ({max})")]
    DutyRange { name: String, min: u8, max: u8 },
    #[error("pid.{set}: out_min ({min}) must be lower than out_max ({max})")]
    OutputRange { set: &'static str, min: f64, max: f64 },
    #[error("pid: gain scheduling needs both [pid.low] and pid.high_low_switch")]
    IncompleteSchedule,
    #[error("grid source {0} requires grid.address")]
    MissingMeterAddress(GridSource),
    #[error("override {path}: {reason}")]
    Override { path: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    /// 0 = warnings only, 1 = info, 2 = verbose
    #[serde(default = "default_debug")]
    #[validate(range(max = 2))]
    pub debug: u8,
    pub server: ServerConfig,
    #[validate(nested)]
    pub grid: GridConfig,
    #[serde(default)]
    #[validate(nested)]
    pub control: ControlConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    pub pid: PidConfig,
    #[validate(nested)]
    pub loads: Vec<LoadConfig>,
    #[serde(default)]
    pub overrides: OverridesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Where grid power and voltage come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GridSource {
    /// Single phase meter, `EM1.GetStatus`
    Em,
    /// Three phase meter aggregate, `EM.GetStatus`
    #[serde(rename = "3em")]
    #[strum(serialize = "3em")]
    ThreeEm,
    /// Values pushed to the feed endpoints
    Feed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GridConfig {
    pub source: GridSource,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_nominal_voltage")]
    #[validate(range(exclusive_min = 0.0))]
    pub nominal_voltage: f64,
    /// AC half cycle in microseconds (10000 for 50Hz)
    #[serde(default = "default_semi_period_us")]
    #[validate(range(min = 1))]
    pub semi_period_us: u32,
    #[serde(default = "default_meter_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl GridConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControlConfig {
    #[serde(default = "default_tick_ms")]
    #[validate(range(min = 100))]
    pub tick_ms: u64,
    #[serde(default = "default_dispatch_timeout_ms")]
    #[validate(range(min = 1))]
    pub dispatch_timeout_ms: u64,
    #[serde(default = "default_transition_seconds")]
    #[validate(range(min = 0.0))]
    pub transition_seconds: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            transition_seconds: default_transition_seconds(),
        }
    }
}

impl ControlConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// How a bypass (forced full power) is carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BypassMode {
    /// The switch drives every dimmer to 100%
    #[default]
    Virtual,
    /// The switch closes a contactor around the dimmer, which must then stay off
    Contactor,
    /// No switch: bypass is only set per load through the status endpoint
    Api,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassConfig {
    #[serde(default)]
    pub mode: BypassMode,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub switch_id: Option<u32>,
}

impl BypassConfig {
    /// Host and switch id to poll, if the bypass switch is reachable at all.
    pub fn switch_target(&self, grid: &GridConfig) -> Option<(String, u32)> {
        if self.mode == BypassMode::Api {
            return None;
        }
        let address = self.address.clone().or_else(|| grid.address.clone())?;
        let id = self.switch_id.or(match grid.source {
            GridSource::Em => Some(0),
            GridSource::ThreeEm => Some(100),
            GridSource::Feed => None,
        })?;
        Some((address, id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    pub setpoint: f64,
    #[serde(default)]
    pub proportional_mode: ProportionalMode,
    #[serde(default)]
    pub derivative_mode: DerivativeMode,
    #[serde(default)]
    pub integral_correction: IntegralCorrection,
    #[serde(default)]
    pub reverse: bool,
    /// Grid distance to the setpoint under which the low gain set is used
    #[serde(default)]
    pub high_low_switch: Option<f64>,
    pub high: Tuning,
    #[serde(default)]
    pub low: Option<Tuning>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoadConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub address: String,
    /// 0 disables the load
    pub resistance: f64,
    #[serde(default = "default_power_ratio")]
    #[validate(range(min = 0.0))]
    pub power_ratio: f64,
    /// 0 means unlimited
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub power_limit: f64,
    #[serde(default = "default_true")]
    pub use_phase_lut: bool,
    #[serde(default = "default_turn_off_delay_ms")]
    pub turn_off_delay_ms: u64,
    #[serde(default)]
    pub duty_min: u8,
    #[serde(default = "default_duty_max")]
    #[validate(range(max = 100))]
    pub duty_max: u8,
}

impl LoadConfig {
    pub fn is_enabled(&self) -> bool {
        self.resistance > 0.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverridesConfig {
    /// Host exposing the virtual components
    #[serde(default)]
    pub address: Option<String>,
    /// Configuration path -> source identifier (`number:200`, `boolean:201`)
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("DIVERTER_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DIVERTER__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Config = figment.extract()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Loads with a non-zero resistance, in configuration order.
    pub fn enabled_loads(&self) -> impl Iterator<Item = &LoadConfig> {
        self.loads.iter().filter(|l| l.is_enabled())
    }

    /// Field ranges through `validator`, then the cross-field rules.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.loads.is_empty() {
            return Err(ConfigError::NoLoads);
        }

        let mut names = HashSet::new();
        for load in &self.loads {
            if !names.insert(load.name.as_str()) {
                return Err(ConfigError::DuplicateLoad(load.name.clone()));
            }
            if load.resistance < 0.0 || load.resistance.is_nan() {
                return Err(ConfigError::NegativeResistance {
                    name: load.name.clone(),
                    value: load.resistance,
                });
            }
            if load.duty_min >= load.duty_max {
                return Err(ConfigError::DutyRange {
                    name: load.name.clone(),
                    min: load.duty_min,
                    max: load.duty_max,
                });
            }
        }

        check_tuning("high", &self.pid.high)?;
        if let Some(low) = &self.pid.low {
            check_tuning("low", low)?;
        }
        if self.pid.low.is_some() != self.pid.high_low_switch.is_some() {
            return Err(ConfigError::IncompleteSchedule);
        }

        if matches!(self.grid.source, GridSource::Em | GridSource::ThreeEm)
            && self.grid.address.is_none()
        {
            return Err(ConfigError::MissingMeterAddress(self.grid.source));
        }

        let load_names: Vec<&str> = self.enabled_loads().map(|l| l.name.as_str()).collect();
        OverrideRegistry::from_config(&self.overrides, &load_names).map_err(|e| {
            ConfigError::Override {
                path: e.path().to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(())
    }
}

fn check_tuning(set: &'static str, t: &Tuning) -> Result<(), ConfigError> {
    if !(t.out_min < t.out_max) {
        return Err(ConfigError::OutputRange {
            set,
            min: t.out_min,
            max: t.out_max,
        });
    }
    Ok(())
}

fn default_debug() -> u8 {
    1
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_nominal_voltage() -> f64 {
    230.0
}
fn default_semi_period_us() -> u32 {
    10_000
}
fn default_meter_timeout_ms() -> u64 {
    5_000
}
fn default_tick_ms() -> u64 {
    1_000
}
fn default_dispatch_timeout_ms() -> u64 {
    5_000
}
fn default_transition_seconds() -> f64 {
    0.5
}
fn default_power_ratio() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_turn_off_delay_ms() -> u64 {
    5 * 60 * 1000
}
fn default_duty_max() -> u8 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const BASE: &str = r#"
        debug = 1

        [server]
        host = "127.0.0.1"
        port = 8080

        [grid]
        source = "em"
        address = "192.168.1.20"

        [pid]
        setpoint = -100.0

        [pid.high]
        kp = 0.2
        ki = 0.4
        kd = 0.05
        out_min = -300.0
        out_max = 2000.0

        [[loads]]
        name = "boiler"
        address = "192.168.1.30"
        resistance = 85.0
    "#;

    fn load_from(toml: &str) -> Result<Config, ConfigError> {
        Config::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    #[test]
    fn test_minimal_config_applies_defaults() {
        let cfg = load_from(BASE).unwrap();
        assert_eq!(cfg.grid.semi_period_us, 10_000);
        assert_eq!(cfg.control.tick_ms, 1_000);
        assert_eq!(cfg.bypass.mode, BypassMode::Virtual);
        assert_eq!(cfg.pid.proportional_mode, ProportionalMode::Input);
        assert_eq!(cfg.pid.integral_correction, IntegralCorrection::Clamp);

        let boiler = &cfg.loads[0];
        assert_eq!(boiler.power_ratio, 1.0);
        assert_eq!(boiler.duty_max, 100);
        assert_eq!(boiler.turn_off_delay_ms, 300_000);
        assert!(boiler.use_phase_lut);
    }

    #[test]
    fn test_switch_target_defaults_per_meter() {
        let cfg = load_from(BASE).unwrap();
        assert_eq!(
            cfg.bypass.switch_target(&cfg.grid),
            Some(("192.168.1.20".to_string(), 0))
        );

        let three = BASE.replace("source = \"em\"", "source = \"3em\"");
        let cfg = load_from(&three).unwrap();
        assert_eq!(cfg.grid.source, GridSource::ThreeEm);
        assert_eq!(cfg.bypass.switch_target(&cfg.grid).map(|t| t.1), Some(100));
    }

    #[test]
    fn test_rejects_no_loads() {
        // top-level keys must come before the first table
        let without_loads = BASE.split("[[loads]]").next().unwrap();
        let toml = format!("loads = []\n{without_loads}");
        assert!(matches!(load_from(&toml), Err(ConfigError::NoLoads)));
    }

    #[test]
    fn test_rejects_negative_resistance() {
        let toml = BASE.replace("resistance = 85.0", "resistance = -1.0");
        assert!(matches!(
            load_from(&toml),
            Err(ConfigError::NegativeResistance { .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_duty_range() {
        let toml = format!("{BASE}\nduty_min = 50\nduty_max = 50\n");
        assert!(matches!(load_from(&toml), Err(ConfigError::DutyRange { .. })));
    }

    #[test]
    fn test_rejects_duty_max_above_100() {
        let toml = format!("{BASE}\nduty_max = 101\n");
        assert!(matches!(load_from(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_grid_source() {
        let toml = BASE.replace("source = \"em\"", "source = \"modbus\"");
        assert!(matches!(load_from(&toml), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_rejects_unknown_bypass_mode() {
        let toml = format!("{BASE}\n[bypass]\nmode = \"relay\"\n");
        assert!(matches!(load_from(&toml), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_rejects_half_configured_schedule() {
        let toml = BASE.replace("setpoint = -100.0", "setpoint = -100.0\nhigh_low_switch = 200.0");
        assert!(matches!(
            load_from(&toml),
            Err(ConfigError::IncompleteSchedule)
        ));
    }

    #[test]
    fn test_rejects_override_on_unknown_load() {
        let toml = format!(
            "{BASE}\n[overrides.bindings]\n\"loads.pool.power_limit\" = \"number:200\"\n"
        );
        assert!(matches!(load_from(&toml), Err(ConfigError::Override { .. })));
    }

    #[test]
    fn test_zero_resistance_load_is_disabled() {
        let toml = format!(
            "{BASE}\n[[loads]]\nname = \"pool\"\naddress = \"192.168.1.31\"\nresistance = 0.0\n"
        );
        let cfg = load_from(&toml).unwrap();
        let enabled: Vec<_> = cfg.enabled_loads().map(|l| l.name.as_str()).collect();
        assert_eq!(enabled, vec!["boiler"]);
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("diverter.toml", BASE)?;
            jail.set_env("DIVERTER__PID__SETPOINT", "-50");
            let figment = Figment::new()
                .merge(Toml::file("diverter.toml"))
                .merge(Env::prefixed("DIVERTER__").split("__"));
            let cfg = Config::from_figment(figment).expect("valid config");
            assert_eq!(cfg.pid.setpoint, -50.0);
            Ok(())
        });
    }
}
