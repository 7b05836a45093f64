//! Administrative commands carried by the status endpoint's query string.
//!
//! Commands are parsed leniently: a pair whose value cannot be understood is
//! dropped, and a load name that does not exist is a no-op when applied.

use std::str::FromStr;

use tracing::{debug, info};

use crate::controller::state::ControllerState;

/// Mode requested for one or all loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ModeRequest {
    Standby,
    Auto,
    Bypass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    All,
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    /// 0 warnings, 1 info, 2 verbose
    Debug(u8),
    Setpoint(f64),
    Reset,
    SetMode { target: LoadTarget, mode: ModeRequest },
}

impl AdminCommand {
    /// Parse one query pair. `None` when the pair carries nothing usable.
    pub fn parse(key: &str, value: &str) -> Option<Self> {
        match key {
            "debug" => value
                .parse::<u8>()
                .ok()
                .filter(|level| *level <= 2)
                .map(AdminCommand::Debug),
            "setpoint" => value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(AdminCommand::Setpoint),
            "reset" => Some(AdminCommand::Reset),
            "all" => ModeRequest::from_str(value).ok().map(|mode| AdminCommand::SetMode {
                target: LoadTarget::All,
                mode,
            }),
            name => ModeRequest::from_str(value).ok().map(|mode| AdminCommand::SetMode {
                target: LoadTarget::Named(name.to_string()),
                mode,
            }),
        }
    }

    /// Parse a whole query, keeping its order.
    pub fn parse_query(pairs: &[(String, String)]) -> Vec<Self> {
        pairs
            .iter()
            .filter_map(|(k, v)| {
                let cmd = Self::parse(k, v);
                if cmd.is_none() {
                    debug!(key = %k, value = %v, "ignored status parameter");
                }
                cmd
            })
            .collect()
    }

    /// Mutate the controller state. Returns false when nothing matched.
    pub fn apply(&self, state: &mut ControllerState) -> bool {
        match self {
            AdminCommand::Debug(level) => {
                state.debug = *level;
                true
            }
            AdminCommand::Setpoint(w) => {
                info!(setpoint_w = *w, "setpoint changed");
                state.pid.set_setpoint(*w);
                true
            }
            AdminCommand::Reset => {
                info!("controller reset");
                state.reset();
                true
            }
            AdminCommand::SetMode { target, mode } => {
                let apply_mode = |load: &mut crate::domain::Load| match mode {
                    ModeRequest::Standby => load.set_standby(),
                    ModeRequest::Auto => load.set_auto(),
                    ModeRequest::Bypass => {
                        load.engage_bypass();
                    }
                };
                match target {
                    LoadTarget::All => {
                        state.loads.iter_mut().for_each(apply_mode);
                        info!(%mode, "mode set on all loads");
                        true
                    }
                    LoadTarget::Named(name) => match state.load_mut(name) {
                        Some(load) => {
                            apply_mode(load);
                            info!(load = %name, %mode, "mode set");
                            true
                        }
                        None => {
                            debug!(load = %name, "unknown load, ignored");
                            false
                        }
                    },
                }
            }
        }
    }
}
