use anyhow::{Context, Result};
use bitbox_connect::{BtcCoin, BtcScriptType};
use tracing::info;

use crate::cli::{Coin, PubkeyArgs};
use crate::commands::common::{connect_and_pair, open_store, parse_keypath};

pub async fn run(args: PubkeyArgs) -> Result<()> {
    let keypath = parse_keypath(&args.path)?;
    info!(
        "pubkey command started: coin={:?} path={} display={}",
        args.coin, keypath, args.display
    );
    let store = open_store(&args.device);
    let connected = connect_and_pair(&args.device, store).await?;

    let key = match args.coin {
        Coin::Eth => connected
            .handle
            .eth_pub(&keypath, args.chain_id, args.display)
            .await
            .context("ethereum public key request failed")?,
        Coin::Btc | Coin::Tbtc => {
            let coin = if args.coin == Coin::Btc {
                BtcCoin::Btc
            } else {
                BtcCoin::Tbtc
            };
            let script_type = if args.taproot {
                BtcScriptType::P2tr
            } else {
                BtcScriptType::P2wpkh
            };
            connected
                .handle
                .btc_pub(&keypath, coin, script_type, args.display)
                .await
                .context("bitcoin public key request failed")?
        }
    };

    println!("Public key: {}", hex::encode(&key.pubkey));
    if let Some(address) = &key.address {
        println!("Address:    {address}");
    }
    connected.handle.disconnect();
    Ok(())
}
