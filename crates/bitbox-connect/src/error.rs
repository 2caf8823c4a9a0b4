use bbp_codec::FramingError;
use bbp_core::{ChannelError, LinkError};
use thiserror::Error;

/// High-level category for a [`DeviceError`].
///
/// Drives retry and recovery decisions in callers without string matching.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceErrorKind {
    /// The wire or the record layer can no longer be trusted. Re-pair.
    Integrity,
    /// The device answered with something the protocol does not allow.
    Protocol,
    /// The device tried to bias or skip the signing nonce protocol.
    Security,
    /// Try again later; the channel is still fine.
    Recoverable,
    /// The user declined on the device or on the host.
    User,
    Timeout,
    Cancelled,
    /// Connection or pairing lifecycle prevents the call.
    Lifecycle,
    /// The caller's request was invalid before it reached the device.
    Validation,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("framing error: {0}")]
    Framing(FramingError),
    #[error("replay or desync: expected counter {expected}, got {actual}")]
    ReplayOrDesync { expected: u64, actual: u64 },
    #[error("record authentication failed")]
    AuthenticationFailed,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The device produced a signature before committing to its nonce.
    #[error("commitment order violation: {0}")]
    CommitmentOrderViolation(&'static str),
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(#[from] bbp_crypto::AntiKleptoError),
    #[error("device busy")]
    DeviceBusy,
    #[error("device locked")]
    DeviceLocked,
    #[error("user aborted")]
    UserAborted,
    #[error("device failure: {0}")]
    DeviceFailure(String),
    #[error("timeout")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("channel degraded by an unfinished exchange; pair again")]
    ChannelDegraded,
    #[error("not paired")]
    NotPaired,
    #[error("disconnected")]
    Disconnected,
    #[error("channel error: {0}")]
    Channel(ChannelError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

impl From<ChannelError> for DeviceError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Framing(err) => Self::Framing(err),
            ChannelError::ReplayOrDesync { expected, actual } => {
                Self::ReplayOrDesync { expected, actual }
            }
            ChannelError::AuthenticationFailed => Self::AuthenticationFailed,
            ChannelError::Timeout => Self::Timeout,
            ChannelError::NotPaired => Self::NotPaired,
            ChannelError::Disconnected | ChannelError::Link(LinkError::Closed) => {
                Self::Disconnected
            }
            other => Self::Channel(other),
        }
    }
}

impl From<FramingError> for DeviceError {
    fn from(err: FramingError) -> Self {
        Self::Framing(err)
    }
}

impl DeviceError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn kind(&self) -> DeviceErrorKind {
        match self {
            Self::Framing(_) | Self::ReplayOrDesync { .. } | Self::AuthenticationFailed => {
                DeviceErrorKind::Integrity
            }
            Self::ProtocolViolation(_) | Self::DeviceFailure(_) => DeviceErrorKind::Protocol,
            Self::CommitmentOrderViolation(_) | Self::SignatureVerificationFailed(_) => {
                DeviceErrorKind::Security
            }
            Self::DeviceBusy | Self::DeviceLocked => DeviceErrorKind::Recoverable,
            Self::UserAborted => DeviceErrorKind::User,
            Self::Timeout => DeviceErrorKind::Timeout,
            Self::Cancelled => DeviceErrorKind::Cancelled,
            Self::ChannelDegraded | Self::NotPaired | Self::Disconnected => {
                DeviceErrorKind::Lifecycle
            }
            Self::Channel(err) => match err {
                ChannelError::PairingRejected => DeviceErrorKind::User,
                ChannelError::Framing(_)
                | ChannelError::ReplayOrDesync { .. }
                | ChannelError::AuthenticationFailed => DeviceErrorKind::Integrity,
                ChannelError::DeviceRejectedPairing | ChannelError::PairingCodeMismatch => {
                    DeviceErrorKind::Security
                }
                _ => DeviceErrorKind::Protocol,
            },
            Self::InvalidRequest(_) => DeviceErrorKind::Validation,
        }
    }

    /// Short uppercase code suitable for JSON output and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Framing(_) => "FRAMING",
            Self::ReplayOrDesync { .. } => "REPLAY_OR_DESYNC",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::CommitmentOrderViolation(_) => "COMMITMENT_ORDER_VIOLATION",
            Self::SignatureVerificationFailed(_) => "SIGNATURE_VERIFICATION_FAILED",
            Self::DeviceBusy => "DEVICE_BUSY",
            Self::DeviceLocked => "DEVICE_LOCKED",
            Self::UserAborted => "USER_ABORTED",
            Self::DeviceFailure(_) => "DEVICE_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ChannelDegraded => "CHANNEL_DEGRADED",
            Self::NotPaired => "NOT_PAIRED",
            Self::Disconnected => "DISCONNECTED",
            Self::Channel(_) => "CHANNEL",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    /// Whether retrying the same call later can succeed without re-pairing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            DeviceErrorKind::Recoverable | DeviceErrorKind::User | DeviceErrorKind::Cancelled
        )
    }

    pub fn is_integrity_failure(&self) -> bool {
        self.kind() == DeviceErrorKind::Integrity
    }
}
