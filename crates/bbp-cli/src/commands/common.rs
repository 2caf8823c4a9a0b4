use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bbp_core::{ChannelStore, FileChannelStore};
use bbp_sim::SimulatedDevice;
use bitbox_connect::{DeviceConfig, DeviceEvent, DeviceHandle, Keypath, PairingOutcome, Progress};
use tracing::{debug, info};

use crate::cli::DeviceArgs;
use crate::config::{default_storage_path, parse_seed};
use crate::pairing::CliPairingConfirmer;

pub struct Connected {
    pub handle: DeviceHandle,
    pub outcome: PairingOutcome,
}

pub fn open_store(args: &DeviceArgs) -> Arc<dyn ChannelStore> {
    let path = args
        .storage_path
        .clone()
        .unwrap_or_else(default_storage_path);
    debug!("channel store at {}", path.display());
    Arc::new(FileChannelStore::new(path))
}

pub fn simulated_device(args: &DeviceArgs) -> Result<SimulatedDevice> {
    let seed = parse_seed(args.seed.as_deref()).context("invalid --seed")?;
    let device = SimulatedDevice::new(seed).with_behaviour(args.behaviour.into());
    Ok(if args.locked { device.locked() } else { device })
}

pub fn device_config(args: &DeviceArgs) -> DeviceConfig {
    DeviceConfig::new(args.device_id.clone())
        .with_handshake_timeout(Duration::from_secs(args.handshake_timeout_secs))
        .with_call_timeout(Duration::from_secs(args.timeout_secs))
}

/// Starts the simulator, connects and pairs (or resumes).
pub async fn connect_and_pair(args: &DeviceArgs, store: Arc<dyn ChannelStore>) -> Result<Connected> {
    let device = simulated_device(args)?;
    println!("Connecting to {}...", args.device_id);
    let handle = bbp_sim::connect(&device, device_config(args), store);
    spawn_progress_printer(&handle);

    let confirmer = Arc::new(CliPairingConfirmer {
        assume_yes: args.yes,
    });
    let outcome = handle.pair(confirmer).await.context("pairing failed")?;
    info!(
        "paired: channel={} resumed={}",
        hex::encode(outcome.channel_id),
        outcome.resumed
    );
    Ok(Connected { handle, outcome })
}

fn spawn_progress_printer(handle: &DeviceHandle) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DeviceEvent::Progress {
                    progress: Progress::ConfirmOnDevice,
                    ..
                } => println!("Confirm on the device..."),
                DeviceEvent::Progress {
                    progress: Progress::ButtonPressed,
                    ..
                } => println!("Confirmed on device."),
                DeviceEvent::Disconnected => break,
                other => debug!("device event: {other:?}"),
            }
        }
    });
}

pub fn parse_keypath(path: &str) -> Result<Keypath> {
    path.parse()
        .map_err(|err| anyhow::anyhow!("invalid keypath '{path}': {err}"))
}

/// 32 bytes, hex with or without `0x`.
pub fn parse_hash(label: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .with_context(|| format!("{label} is not hex"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("{label} must be 32 bytes, got {}", bytes.len()))
}
