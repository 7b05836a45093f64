use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grid telemetry failures. All are recoverable: the cycle is skipped and
/// retried on the next tick.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("meter request failed: {0}")]
    Transport(String),
    #[error("meter replied with status {0}")]
    Status(u16),
    #[error("meter reply could not be decoded: {0}")]
    Decode(String),
    #[error("meter reported a non-finite value ({voltage_v} V, {power_w} W)")]
    NonFinite { voltage_v: f64, power_w: f64 },
    #[error("feed has not received both voltage and power yet")]
    FeedNotReady,
    #[error("meter did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Source of grid voltage and power, polled once per cycle.
#[async_trait]
pub trait GridMeter: Send + Sync {
    async fn read(&self) -> Result<GridReading, TelemetryError>;
}

/// One grid telemetry sample. Positive power is imported from the grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridReading {
    pub voltage_v: f64,
    pub power_w: f64,
}

impl GridReading {
    pub fn new(voltage_v: f64, power_w: f64) -> Self {
        Self { voltage_v, power_w }
    }

    pub fn is_finite(&self) -> bool {
        self.voltage_v.is_finite() && self.power_w.is_finite()
    }

    /// Reject NaN and infinite samples before they reach the PID
    pub fn checked(self) -> Result<Self, TelemetryError> {
        if self.is_finite() {
            Ok(self)
        } else {
            Err(TelemetryError::NonFinite {
                voltage_v: self.voltage_v,
                power_w: self.power_w,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_reading() {
        assert!(GridReading::new(230.0, -120.0).is_finite());
        assert!(!GridReading::new(f64::NAN, -120.0).is_finite());
        assert!(!GridReading::new(230.0, f64::INFINITY).is_finite());
    }

    #[test]
    fn test_checked_rejects_nan() {
        assert!(GridReading::new(230.0, 10.0).checked().is_ok());
        assert!(matches!(
            GridReading::new(230.0, f64::NAN).checked(),
            Err(TelemetryError::NonFinite { .. })
        ));
    }
}
