//! Live parameter overrides.
//!
//! A binding maps a configuration path (`pid.setpoint`, `loads.boiler.power_limit`)
//! to a numeric or boolean virtual component on an external host. Paths are
//! resolved to a typed [`OverrideKey`] once, when the configuration is loaded,
//! and the key's value kind is checked against the source kind at that point.
//! Before each cycle the bound values are fetched and applied; a source that
//! cannot be read is skipped with a warning.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OverridesConfig;
use crate::controller::pid::{GainSet, Tuning};
use crate::controller::state::ControllerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    Number,
    Boolean,
}

/// Virtual component identifier, written `number:200` or `boolean:201`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceId {
    pub kind: SourceKind,
    pub id: u32,
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <kind>:<id>, got {s:?}"))?;
        let kind = kind
            .parse::<SourceKind>()
            .map_err(|_| format!("unknown source kind {kind:?}"))?;
        let id = id
            .parse::<u32>()
            .map_err(|_| format!("invalid source id {id:?}"))?;
        Ok(Self { kind, id })
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverrideValue {
    Number(f64),
    Boolean(bool),
}

impl OverrideValue {
    pub fn kind(&self) -> SourceKind {
        match self {
            OverrideValue::Number(_) => SourceKind::Number,
            OverrideValue::Boolean(_) => SourceKind::Boolean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum GainField {
    Kp,
    Ki,
    Kd,
    OutMin,
    OutMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LoadField {
    PowerRatio,
    PowerLimit,
    DutyMin,
    DutyMax,
    TurnOffDelayMs,
    UsePhaseLut,
}

/// A resolved, live-tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKey {
    Setpoint,
    HighLowSwitch,
    Gain { set: GainSet, field: GainField },
    /// `index` is the position among the instantiated loads
    Load { index: usize, field: LoadField },
}

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("unknown parameter")]
    UnknownPath { path: String },
    #[error("no enabled load named {load:?}")]
    UnknownLoad { path: String, load: String },
    #[error("bad source: {reason}")]
    BadSource { path: String, reason: String },
    #[error("expects a {expected} source, bound to a {found} source")]
    KindMismatch {
        path: String,
        expected: SourceKind,
        found: SourceKind,
    },
    #[error("source unavailable: {reason}")]
    Unavailable { path: String, reason: String },
    #[error("value rejected: {reason}")]
    Rejected { path: String, reason: String },
}

impl OverrideError {
    pub fn path(&self) -> &str {
        match self {
            OverrideError::UnknownPath { path }
            | OverrideError::UnknownLoad { path, .. }
            | OverrideError::BadSource { path, .. }
            | OverrideError::KindMismatch { path, .. }
            | OverrideError::Unavailable { path, .. }
            | OverrideError::Rejected { path, .. } => path,
        }
    }
}

impl OverrideKey {
    /// Resolve a dotted path against the enabled load names.
    pub fn parse(path: &str, load_names: &[&str]) -> Result<Self, OverrideError> {
        let unknown = || OverrideError::UnknownPath {
            path: path.to_string(),
        };
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            ["pid", "setpoint"] => Ok(OverrideKey::Setpoint),
            ["pid", "high_low_switch"] => Ok(OverrideKey::HighLowSwitch),
            ["pid", set, field] => {
                let set = match *set {
                    "high" => GainSet::High,
                    "low" => GainSet::Low,
                    _ => return Err(unknown()),
                };
                let field = field.parse().map_err(|_| unknown())?;
                Ok(OverrideKey::Gain { set, field })
            }
            ["loads", name, field] => {
                let field = field.parse().map_err(|_| unknown())?;
                let index = load_names.iter().position(|n| n == name).ok_or_else(|| {
                    OverrideError::UnknownLoad {
                        path: path.to_string(),
                        load: name.to_string(),
                    }
                })?;
                Ok(OverrideKey::Load { index, field })
            }
            _ => Err(unknown()),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            OverrideKey::Load {
                field: LoadField::UsePhaseLut,
                ..
            } => SourceKind::Boolean,
            _ => SourceKind::Number,
        }
    }

    /// Write the value into the live state. The previous value is kept when
    /// the new one would break an invariant.
    pub fn apply(&self, state: &mut ControllerState, value: OverrideValue) -> Result<(), String> {
        match (*self, value) {
            (OverrideKey::Setpoint, OverrideValue::Number(v)) => {
                finite(v)?;
                state.pid.set_setpoint(v);
            }
            (OverrideKey::HighLowSwitch, OverrideValue::Number(v)) => {
                finite(v)?;
                if state.schedule.low.is_none() {
                    return Err("no low gain set configured".into());
                }
                if v < 0.0 {
                    return Err(format!("threshold must not be negative (got {v})"));
                }
                state.schedule.switch_threshold = Some(v);
            }
            (OverrideKey::Gain { set, field }, OverrideValue::Number(v)) => {
                finite(v)?;
                let tuning = match set {
                    GainSet::High => &mut state.schedule.high,
                    GainSet::Low => state
                        .schedule
                        .low
                        .as_mut()
                        .ok_or("no low gain set configured")?,
                };
                let mut next = *tuning;
                set_gain(&mut next, field, v);
                if !(next.out_min < next.out_max) {
                    return Err(format!(
                        "out_min ({}) must be lower than out_max ({})",
                        next.out_min, next.out_max
                    ));
                }
                *tuning = next;
            }
            (OverrideKey::Load { index, field }, value) => {
                let load = state
                    .loads
                    .get_mut(index)
                    .ok_or_else(|| format!("no load at position {index}"))?;
                let spec = &mut load.spec;
                match (field, value) {
                    (LoadField::UsePhaseLut, OverrideValue::Boolean(b)) => spec.use_phase_lut = b,
                    (LoadField::PowerRatio, OverrideValue::Number(v)) => {
                        spec.power_ratio = non_negative(v)?;
                    }
                    (LoadField::PowerLimit, OverrideValue::Number(v)) => {
                        spec.power_limit_w = non_negative(v)?;
                    }
                    (LoadField::TurnOffDelayMs, OverrideValue::Number(v)) => {
                        let ms = non_negative(v)?.round() as u64;
                        spec.turn_off_delay = Duration::from_millis(ms);
                    }
                    (LoadField::DutyMin, OverrideValue::Number(v)) => {
                        let min = percent(v)?;
                        if min >= spec.duty_max {
                            return Err(format!("duty_min {min} >= duty_max {}", spec.duty_max));
                        }
                        spec.duty_min = min;
                    }
                    (LoadField::DutyMax, OverrideValue::Number(v)) => {
                        let max = percent(v)?;
                        if spec.duty_min >= max {
                            return Err(format!("duty_min {} >= duty_max {max}", spec.duty_min));
                        }
                        spec.duty_max = max;
                    }
                    (_, value) => return Err(format!("unexpected {} value", value.kind())),
                }
            }
            (_, value) => return Err(format!("unexpected {} value", value.kind())),
        }
        Ok(())
    }
}

fn set_gain(t: &mut Tuning, field: GainField, v: f64) {
    match field {
        GainField::Kp => t.kp = v,
        GainField::Ki => t.ki = v,
        GainField::Kd => t.kd = v,
        GainField::OutMin => t.out_min = v,
        GainField::OutMax => t.out_max = v,
    }
}

fn finite(v: f64) -> Result<f64, String> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("{v} is not a finite number"))
    }
}

fn non_negative(v: f64) -> Result<f64, String> {
    let v = finite(v)?;
    if v < 0.0 {
        return Err(format!("{v} must not be negative"));
    }
    Ok(v)
}

fn percent(v: f64) -> Result<u8, String> {
    let v = finite(v)?.round();
    if !(0.0..=100.0).contains(&v) {
        return Err(format!("{v} is outside 0..=100"));
    }
    Ok(v as u8)
}

/// External store of virtual component values.
#[async_trait]
pub trait OverrideSource: Send + Sync {
    async fn fetch(&self, source: SourceId) -> anyhow::Result<OverrideValue>;
}

#[derive(Debug, Clone)]
pub struct OverrideBinding {
    pub path: String,
    pub key: OverrideKey,
    pub source: SourceId,
}

#[derive(Debug, Clone, Default)]
pub struct OverrideRegistry {
    bindings: Vec<OverrideBinding>,
}

impl OverrideRegistry {
    /// Resolve and type-check every binding. `load_names` are the enabled
    /// loads in instantiation order.
    pub fn from_config(cfg: &OverridesConfig, load_names: &[&str]) -> Result<Self, OverrideError> {
        let mut bindings = Vec::with_capacity(cfg.bindings.len());
        for (path, source) in &cfg.bindings {
            let key = OverrideKey::parse(path, load_names)?;
            let source: SourceId = source.parse().map_err(|reason| OverrideError::BadSource {
                path: path.clone(),
                reason,
            })?;
            if key.kind() != source.kind {
                return Err(OverrideError::KindMismatch {
                    path: path.clone(),
                    expected: key.kind(),
                    found: source.kind,
                });
            }
            bindings.push(OverrideBinding {
                path: path.clone(),
                key,
                source,
            });
        }
        Ok(Self { bindings })
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> &[OverrideBinding] {
        &self.bindings
    }

    /// Fetch every bound value and apply it. Returns the failures, each
    /// already logged; the remaining bindings are still applied.
    pub async fn refresh(
        &self,
        source: &dyn OverrideSource,
        state: &mut ControllerState,
    ) -> Vec<OverrideError> {
        let mut errors = Vec::new();
        for binding in &self.bindings {
            let value = match source.fetch(binding.source).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        path = %binding.path,
                        source = %binding.source,
                        error = %e,
                        "override source unavailable"
                    );
                    errors.push(OverrideError::Unavailable {
                        path: binding.path.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match binding.key.apply(state, value) {
                Ok(()) => debug!(path = %binding.path, ?value, "override applied"),
                Err(reason) => {
                    warn!(path = %binding.path, %reason, "override rejected");
                    errors.push(OverrideError::Rejected {
                        path: binding.path.clone(),
                        reason,
                    });
                }
            }
        }
        errors
    }
}
