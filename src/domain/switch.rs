use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("switch request failed: {0}")]
    Transport(String),
    #[error("switch replied with status {0}")]
    Status(u16),
    #[error("switch reply could not be decoded: {0}")]
    Decode(String),
}

/// External bypass indicator (a physical switch or contactor auxiliary).
#[async_trait]
pub trait BypassSwitch: Send + Sync {
    async fn is_on(&self) -> Result<bool, SwitchError>;
}
