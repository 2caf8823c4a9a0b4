use anyhow::{Context, Result};
use tracing::info;

use crate::cli::PairArgs;
use crate::commands::common::{connect_and_pair, open_store};

pub async fn run(args: PairArgs) -> Result<()> {
    info!(
        "pair command started: device_id={} behaviour={:?} force={}",
        args.device.device_id, args.device.behaviour, args.force
    );
    let store = open_store(&args.device);
    if args.force {
        store
            .forget(&args.device.device_id)
            .await
            .context("failed to clear remembered channel")?;
        println!("Cleared remembered channel for {}", args.device.device_id);
    }

    let connected = connect_and_pair(&args.device, store).await?;
    if connected.outcome.resumed {
        println!("Resumed remembered channel.");
    } else {
        println!("Pairing complete.");
    }
    println!("Channel: {}", hex::encode(connected.outcome.channel_id));
    println!(
        "Device: {} {} ({})",
        connected.outcome.info.name,
        connected.outcome.info.version,
        if connected.outcome.info.unlocked {
            "unlocked"
        } else {
            "locked"
        }
    );
    connected.handle.disconnect();
    Ok(())
}
