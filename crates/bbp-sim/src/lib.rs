//! In-memory device simulator speaking the full BitBox pairing protocol.
//!
//! Used by integration tests and the CLI demo in place of a USB or BLE device.

pub mod device;
pub mod link;

use std::sync::Arc;

use async_trait::async_trait;
use bbp_core::{ChannelStore, PairingConfirmer};
use bbp_crypto::PairingCode;
use bitbox_connect::{DeviceConfig, DeviceHandle};
use parking_lot::Mutex;

pub use device::{Behaviour, SimulatedDevice, TranscriptEvent};
pub use link::{SimLink, default_link_pair, link_pair};

/// Spawns `device` on a fresh link and connects a handle to it.
pub fn connect(
    device: &SimulatedDevice,
    config: DeviceConfig,
    store: Arc<dyn ChannelStore>,
) -> DeviceHandle {
    let (host, device_end) = default_link_pair();
    device.spawn(device_end);
    DeviceHandle::connect(host, config, store)
}

/// Confirmer with a fixed answer that remembers the codes it was shown.
#[derive(Debug, Default)]
pub struct FixedConfirmer {
    accept: bool,
    shown: Mutex<Vec<PairingCode>>,
}

impl FixedConfirmer {
    pub fn accept() -> Self {
        Self {
            accept: true,
            shown: Mutex::default(),
        }
    }

    pub fn reject() -> Self {
        Self {
            accept: false,
            shown: Mutex::default(),
        }
    }

    pub fn shown(&self) -> Vec<PairingCode> {
        self.shown.lock().clone()
    }
}

#[async_trait]
impl PairingConfirmer for FixedConfirmer {
    async fn confirm_pairing_code(&self, code: &PairingCode) -> anyhow::Result<bool> {
        self.shown.lock().push(*code);
        Ok(self.accept)
    }
}
