use bbp_codec::FramingError;
use bbp_crypto::CryptoError;
use thiserror::Error;

use crate::link::LinkError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("link_error: {0}")]
    Link(#[from] LinkError),
    #[error("framing_error: {0}")]
    Framing(#[from] FramingError),
    #[error("crypto_error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("replay_or_desync: expected counter {expected}, got {actual}")]
    ReplayOrDesync { expected: u64, actual: u64 },
    #[error("authentication_failed")]
    AuthenticationFailed,
    #[error("not_paired")]
    NotPaired,
    #[error("channel_invalidated")]
    Invalidated,
    #[error("unsupported_version: {0}")]
    UnsupportedVersion(u8),
    #[error("malformed_handshake: {0}")]
    MalformedHandshake(&'static str),
    #[error("unexpected_message: {0:#04x}")]
    UnexpectedMessage(u8),
    #[error("pairing_rejected_by_host")]
    PairingRejected,
    #[error("pairing_rejected_by_device")]
    DeviceRejectedPairing,
    #[error("pairing_code_mismatch")]
    PairingCodeMismatch,
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("store_error: {0}")]
    Store(anyhow::Error),
    #[error("pairing_hook_error: {0}")]
    PairingHook(anyhow::Error),
}

impl ChannelError {
    /// Errors that mean the peer or the wire can no longer be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::Framing(_) | Self::ReplayOrDesync { .. } | Self::AuthenticationFailed
        )
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Link(LinkError::Closed))
    }
}
