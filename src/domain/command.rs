use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure of one dimmer command. Recorded on the load, never fatal.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dimmer request failed: {0}")]
    Transport(String),
    #[error("dimmer error {code}: {message}")]
    Device { code: i64, message: String },
    #[error("dimmer did not answer within {0:?}")]
    Timeout(Duration),
}

/// Transport to a phase-cut dimmer.
#[async_trait]
pub trait DimmerClient: Send + Sync {
    async fn send(&self, command: &DimmerCommand) -> Result<(), DispatchError>;
}

/// Light command sent to one dimmer. Two equal commands are the same request
/// on the wire, which is what dispatch de-duplication relies on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimmerCommand {
    pub address: String,
    /// Dimmer output relay
    pub on: bool,
    /// 0..=100
    pub brightness: u8,
    pub transition_seconds: f64,
}

impl DimmerCommand {
    pub fn new(
        address: impl Into<String>,
        on: bool,
        brightness: u8,
        transition_seconds: f64,
    ) -> Self {
        Self {
            address: address.into(),
            on,
            brightness: brightness.min(100),
            transition_seconds,
        }
    }
}

impl fmt::Display for DimmerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on={} brightness={} transition={}s",
            self.address, self.on, self.brightness, self.transition_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brightness_capped() {
        assert_eq!(DimmerCommand::new("10.0.0.2", true, 150, 0.5).brightness, 100);
    }

    #[test]
    fn test_identity() {
        let a = DimmerCommand::new("10.0.0.2", true, 42, 0.5);
        assert_eq!(a, DimmerCommand::new("10.0.0.2", true, 42, 0.5));
        assert_ne!(a, DimmerCommand::new("10.0.0.3", true, 42, 0.5));
        assert_ne!(a, DimmerCommand::new("10.0.0.2", false, 42, 0.5));
        assert_eq!(a.to_string(), "10.0.0.2 on=true brightness=42 transition=0.5s");
    }
}
