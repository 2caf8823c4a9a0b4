//! Host API for BitBox devices: a single-owner actor multiplexing calls over
//! the secure channel, the typed command codec, the anti-klepto signing
//! engine and the device state machine.

pub mod antiklepto;
pub mod codec;
pub mod coins;
pub mod config;
pub mod error;
pub mod mux;
pub mod proto;
pub mod registry;
pub mod state;
pub mod types;

pub use antiklepto::{
    AntiKleptoSigner, CommitmentPair, SignedPayload, SigningPayload, SigningSession, run_session,
};
pub use codec::{DeviceRequest, DeviceResponse, RequestKind, ResponseKind};
pub use config::DeviceConfig;
pub use error::{DeviceError, DeviceErrorKind, DeviceResult};
pub use mux::{
    CommandInvoker, DeviceHandle, DeviceSession, InvokeOptions, PairingOutcome, SessionSource,
};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use state::{CommandCategory, DeviceEvent, DeviceState, DeviceStateMachine};
pub use types::{
    BtcCoin, BtcScriptType, BtcSignInput, DeviceInfo, EthTransaction, EthTxType, Keypath,
    Progress, PublicKeyInfo, SignatureScheme, TypedDataHash,
};
