//! Push telemetry: voltage and power arrive independently (forwarded from a
//! message bus) and the meter serves the latest pair at tick time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::domain::{GridMeter, GridReading, TelemetryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeedChannel {
    Voltage,
    Power,
}

/// Write side, shared with the HTTP ingest handlers.
#[derive(Clone)]
pub struct FeedPublisher {
    voltage: Arc<watch::Sender<Option<f64>>>,
    power: Arc<watch::Sender<Option<f64>>>,
}

impl FeedPublisher {
    pub fn publish(&self, channel: FeedChannel, value: f64) {
        let tx = match channel {
            FeedChannel::Voltage => &self.voltage,
            FeedChannel::Power => &self.power,
        };
        tx.send_replace(Some(value));
    }
}

pub struct FeedMeter {
    voltage: watch::Receiver<Option<f64>>,
    power: watch::Receiver<Option<f64>>,
}

pub fn feed_channel() -> (FeedPublisher, FeedMeter) {
    let (voltage_tx, voltage_rx) = watch::channel(None);
    let (power_tx, power_rx) = watch::channel(None);
    (
        FeedPublisher {
            voltage: Arc::new(voltage_tx),
            power: Arc::new(power_tx),
        },
        FeedMeter {
            voltage: voltage_rx,
            power: power_rx,
        },
    )
}

#[async_trait]
impl GridMeter for FeedMeter {
    async fn read(&self) -> Result<GridReading, TelemetryError> {
        let voltage = *self.voltage.borrow();
        let power = *self.power.borrow();
        match (voltage, power) {
            (Some(v), Some(p)) => GridReading::new(v, p).checked(),
            _ => Err(TelemetryError::FeedNotReady),
        }
    }
}
