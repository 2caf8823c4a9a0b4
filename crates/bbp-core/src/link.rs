use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Nothing arrived within the transport's own poll window. Callers may retry.
    #[error("read_timeout")]
    ReadTimeout,
    #[error("link_closed")]
    Closed,
    #[error("link_error: {0}")]
    Other(#[from] anyhow::Error),
}

impl LinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadTimeout)
    }
}

/// Byte transport carrying fixed-size frames (USB HID report, BLE characteristic).
#[async_trait]
pub trait Link: Send {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError>;
    async fn read(&mut self) -> Result<Vec<u8>, LinkError>;
    fn frame_size(&self) -> usize;
}
