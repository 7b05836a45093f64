//! Shelly Gen2 RPC over HTTP.
//!
//! Every device call is a `GET /rpc/<Method>?<params>` returning JSON. A
//! failed call answers with a non-200 status and a `{code, message}` body.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::controller::overrides::{OverrideSource, OverrideValue, SourceId, SourceKind};
use crate::domain::{
    BypassSwitch, DimmerClient, DimmerCommand, DispatchError, GridMeter, GridReading,
    SwitchError, TelemetryError,
};

/// `http://` is assumed when the address carries no scheme.
pub fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Shared HTTP client for all Shelly calls.
#[derive(Clone)]
pub struct ShellyRpc {
    client: reqwest::Client,
}

impl ShellyRpc {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("power-diverter/0.1"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Status code and raw body of one RPC call.
    async fn call(
        &self,
        address: &str,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let url = format!("{}/rpc/{method}", base_url(address));
        let resp = self.client.get(&url).query(query).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(%url, ?query, %status, %body, "rpc");
        Ok((status, body))
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterKind {
    /// Single phase, `EM1.GetStatus`
    SinglePhase,
    /// Three phase aggregate, `EM.GetStatus`
    ThreePhase,
}

#[derive(Debug, Deserialize)]
struct Em1Status {
    voltage: f64,
    act_power: f64,
}

#[derive(Debug, Deserialize)]
struct EmStatus {
    a_voltage: f64,
    total_act_power: f64,
}

pub struct ShellyMeter {
    rpc: ShellyRpc,
    address: String,
    kind: MeterKind,
}

impl ShellyMeter {
    pub fn new(rpc: ShellyRpc, address: impl Into<String>, kind: MeterKind) -> Self {
        Self {
            rpc,
            address: address.into(),
            kind,
        }
    }
}

fn telemetry_transport(e: reqwest::Error) -> TelemetryError {
    TelemetryError::Transport(e.to_string())
}

#[async_trait]
impl GridMeter for ShellyMeter {
    async fn read(&self) -> Result<GridReading, TelemetryError> {
        let method = match self.kind {
            MeterKind::SinglePhase => "EM1.GetStatus",
            MeterKind::ThreePhase => "EM.GetStatus",
        };
        let (status, body) = self
            .rpc
            .call(&self.address, method, &[("id", "0".to_string())])
            .await
            .map_err(telemetry_transport)?;
        if status != StatusCode::OK {
            return Err(TelemetryError::Status(status.as_u16()));
        }

        let decode = |e: serde_json::Error| TelemetryError::Decode(e.to_string());
        let reading = match self.kind {
            MeterKind::SinglePhase => {
                let s: Em1Status = serde_json::from_str(&body).map_err(decode)?;
                GridReading::new(s.voltage, s.act_power)
            }
            MeterKind::ThreePhase => {
                let s: EmStatus = serde_json::from_str(&body).map_err(decode)?;
                GridReading::new(s.a_voltage, s.total_act_power)
            }
        };
        reading.checked()
    }
}

/// Phase-cut dimmer driven through `Light.Set`.
pub struct ShellyDimmer {
    rpc: ShellyRpc,
}

impl ShellyDimmer {
    pub fn new(rpc: ShellyRpc) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl DimmerClient for ShellyDimmer {
    async fn send(&self, command: &DimmerCommand) -> Result<(), DispatchError> {
        let query = [
            ("id", "0".to_string()),
            ("on", command.on.to_string()),
            ("brightness", command.brightness.to_string()),
            ("transition_duration", command.transition_seconds.to_string()),
        ];
        let (status, body) = self
            .rpc
            .call(&command.address, "Light.Set", &query)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        if status == StatusCode::OK {
            return Ok(());
        }
        Err(match serde_json::from_str::<RpcError>(&body) {
            Ok(err) => DispatchError::Device {
                code: err.code,
                message: err.message,
            },
            Err(_) => DispatchError::Device {
                code: i64::from(status.as_u16()),
                message: body,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    output: bool,
}

/// Bypass indicator read through `Switch.GetStatus`.
pub struct ShellySwitch {
    rpc: ShellyRpc,
    address: String,
    id: u32,
}

impl ShellySwitch {
    pub fn new(rpc: ShellyRpc, address: impl Into<String>, id: u32) -> Self {
        Self {
            rpc,
            address: address.into(),
            id,
        }
    }
}

#[async_trait]
impl BypassSwitch for ShellySwitch {
    async fn is_on(&self) -> Result<bool, SwitchError> {
        let (status, body) = self
            .rpc
            .call(&self.address, "Switch.GetStatus", &[("id", self.id.to_string())])
            .await
            .map_err(|e| SwitchError::Transport(e.to_string()))?;
        match status {
            // no switch on this device
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::OK => serde_json::from_str::<SwitchStatus>(&body)
                .map(|s| s.output)
                .map_err(|e| SwitchError::Decode(e.to_string())),
            other => Err(SwitchError::Status(other.as_u16())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ComponentStatus<T> {
    value: T,
}

/// Number and Boolean virtual components used as live overrides.
pub struct ShellyVirtualComponents {
    rpc: ShellyRpc,
    address: String,
}

impl ShellyVirtualComponents {
    pub fn new(rpc: ShellyRpc, address: impl Into<String>) -> Self {
        Self {
            rpc,
            address: address.into(),
        }
    }
}

#[async_trait]
impl OverrideSource for ShellyVirtualComponents {
    async fn fetch(&self, source: SourceId) -> Result<OverrideValue> {
        let method = match source.kind {
            SourceKind::Number => "Number.GetStatus",
            SourceKind::Boolean => "Boolean.GetStatus",
        };
        let (status, body) = self
            .rpc
            .call(&self.address, method, &[("id", source.id.to_string())])
            .await
            .with_context(|| format!("{source} request failed"))?;
        if status != StatusCode::OK {
            anyhow::bail!("{source}: HTTP {status}: {body}");
        }
        let value = match source.kind {
            SourceKind::Number => {
                let s: ComponentStatus<f64> =
                    serde_json::from_str(&body).with_context(|| format!("{source}: bad reply"))?;
                OverrideValue::Number(s.value)
            }
            SourceKind::Boolean => {
                let s: ComponentStatus<bool> =
                    serde_json::from_str(&body).with_context(|| format!("{source}: bad reply"))?;
                OverrideValue::Boolean(s.value)
            }
        };
        Ok(value)
    }
}
