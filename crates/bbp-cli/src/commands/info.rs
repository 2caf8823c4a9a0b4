use anyhow::{Context, Result};

use crate::cli::InfoArgs;
use crate::commands::common::{connect_and_pair, open_store};

pub async fn run(args: InfoArgs) -> Result<()> {
    let store = open_store(&args.device);
    let connected = connect_and_pair(&args.device, store).await?;
    let info = connected
        .handle
        .device_info()
        .await
        .context("device info request failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Name:        {}", info.name);
        println!("Version:     {}", info.version);
        println!("Initialized: {}", info.initialized);
        println!("Unlocked:    {}", info.unlocked);
        println!("Anti-klepto: {}", info.supports_antiklepto);
        if !info.attestation.is_empty() {
            println!("Attestation: {} bytes", info.attestation.len());
        }
    }
    connected.handle.disconnect();
    Ok(())
}
