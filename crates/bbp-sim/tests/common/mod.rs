#![allow(dead_code)]

use std::sync::Arc;

use bbp_core::{ChannelStore, MemoryChannelStore};
use bbp_sim::{FixedConfirmer, SimulatedDevice, connect};
use bitbox_connect::{DeviceConfig, DeviceHandle, Keypath, PairingOutcome};

pub const SEED: [u8; 32] = [0x5e; 32];

pub fn device() -> SimulatedDevice {
    SimulatedDevice::new(SEED)
}

pub fn memory_store() -> Arc<dyn ChannelStore> {
    Arc::new(MemoryChannelStore::default())
}

pub fn config() -> DeviceConfig {
    DeviceConfig::new("sim-1")
}

pub async fn paired(device: &SimulatedDevice) -> (DeviceHandle, PairingOutcome) {
    let handle = connect(device, config(), memory_store());
    let outcome = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .expect("pairing");
    (handle, outcome)
}

pub fn eth_path(index: u32) -> Keypath {
    format!("m/44'/60'/0'/0/{index}").parse().unwrap()
}

pub fn btc_path() -> Keypath {
    "m/84'/0'/0'/0/0".parse().unwrap()
}
