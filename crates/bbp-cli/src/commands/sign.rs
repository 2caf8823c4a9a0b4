use anyhow::{Context, Result, bail};
use bitbox_connect::{
    AntiKleptoSigner, BtcCoin, BtcScriptType, BtcSignInput, DeviceHandle, EthTransaction,
    EthTxType, Keypath, SignedPayload, SigningPayload, SigningSession, TypedDataHash, coins,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::{DeviceArgs, SignArgs, SignBtcArgs, SignCommand, SignEthArgs, SignTypedDataArgs};
use crate::commands::common::{connect_and_pair, open_store, parse_hash, parse_keypath};

pub async fn run(args: SignArgs) -> Result<()> {
    match args.command {
        SignCommand::Eth(args) => run_eth(args).await,
        SignCommand::TypedData(args) => run_typed_data(args).await,
        SignCommand::Btc(args) => run_btc(args).await,
    }
}

/// Ethereum transaction as accepted on the command line. Quantities are hex.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EthTxJson {
    pub chain_id: u64,
    pub nonce: String,
    pub gas_limit: String,
    pub to: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub data: String,
    pub gas_price: Option<String>,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
}

#[derive(Debug, Serialize)]
struct SignatureOutput {
    #[serde(with = "hex")]
    signature: [u8; 64],
    #[serde(skip_serializing_if = "Option::is_none")]
    recid: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<u64>,
    #[serde(with = "hex")]
    digest: [u8; 32],
}

async fn run_eth(args: SignEthArgs) -> Result<()> {
    let keypath = parse_keypath(&args.path)?;
    let tx_json = if let Some(path) = args.tx.strip_prefix('@') {
        std::fs::read_to_string(path).with_context(|| format!("reading tx file: {path}"))?
    } else {
        args.tx.clone()
    };
    let parsed: EthTxJson = serde_json::from_str(&tx_json).context("failed to parse tx JSON")?;
    let tx = build_transaction(keypath.clone(), parsed)?;
    info!(
        "sign command started: chain=ethereum path={} chain_id={} data_len={}",
        keypath,
        tx.chain_id,
        tx.data.len()
    );

    let chain_id = tx.chain_id;
    let legacy = tx.tx_type == EthTxType::Legacy;
    let signed = sign(&args.device, SigningPayload::EthTransaction(tx), |handle| {
        let keypath = keypath.clone();
        async move { Ok(handle.eth_pub(&keypath, chain_id, false).await?.pubkey) }
    })
    .await?;

    let v = signed.recid.map(|recid| {
        if legacy {
            coins::eip155_v(recid, chain_id)
        } else {
            u64::from(recid)
        }
    });
    print_signature(&signed, v, args.json)
}

async fn run_typed_data(args: SignTypedDataArgs) -> Result<()> {
    let keypath = parse_keypath(&args.path)?;
    let typed = TypedDataHash {
        keypath: keypath.clone(),
        chain_id: args.chain_id,
        domain_separator_hash: parse_hash("domain hash", &args.domain_hash)?,
        message_hash: parse_hash("message hash", &args.message_hash)?,
    };
    info!(
        "sign command started: chain=ethereum typed_data path={} chain_id={}",
        keypath, args.chain_id
    );
    let chain_id = args.chain_id;
    let signed = sign(&args.device, SigningPayload::EthTypedData(typed), |handle| {
        let keypath = keypath.clone();
        async move { Ok(handle.eth_pub(&keypath, chain_id, false).await?.pubkey) }
    })
    .await?;
    let v = signed.recid.map(|recid| u64::from(recid) + 27);
    print_signature(&signed, v, args.json)
}

async fn run_btc(args: SignBtcArgs) -> Result<()> {
    let keypath = parse_keypath(&args.path)?;
    let input = BtcSignInput {
        keypath: keypath.clone(),
        coin: if args.testnet {
            BtcCoin::Tbtc
        } else {
            BtcCoin::Btc
        },
        script_type: if args.taproot {
            BtcScriptType::P2tr
        } else {
            BtcScriptType::P2wpkh
        },
        sighash: parse_hash("sighash", &args.sighash)?,
    };
    info!(
        "sign command started: chain=bitcoin path={} script_type={:?}",
        keypath, input.script_type
    );
    let (coin, script_type) = (input.coin, input.script_type);
    let signed = sign(&args.device, SigningPayload::Btc(input), |handle| {
        let keypath = keypath.clone();
        async move {
            Ok(handle
                .btc_pub(&keypath, coin, script_type, false)
                .await?
                .pubkey)
        }
    })
    .await?;
    print_signature(&signed, None, args.json)
}

/// Pairs, looks up the signing key, then runs one anti-klepto session.
async fn sign<F, Fut>(
    device: &DeviceArgs,
    payload: SigningPayload,
    signing_key: F,
) -> Result<SignedPayload>
where
    F: FnOnce(DeviceHandle) -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    let store = open_store(device);
    let connected = connect_and_pair(device, store).await?;
    let expected_pubkey = signing_key(connected.handle.clone())
        .await
        .context("public key lookup failed")?;

    let signer = AntiKleptoSigner::new(connected.handle.clone());
    let session = SigningSession {
        payload,
        expected_pubkey,
    };
    let signed = signer.sign(&session).await.context("signing failed")?;
    connected.handle.disconnect();
    Ok(signed)
}

fn print_signature(signed: &SignedPayload, v: Option<u64>, json: bool) -> Result<()> {
    if json {
        let output = SignatureOutput {
            signature: signed.signature,
            recid: signed.recid,
            v,
            digest: signed.digest,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    println!("Scheme:    {:?}", signed.scheme);
    println!("Digest:    0x{}", hex::encode(signed.digest));
    println!("Signature: 0x{}", hex::encode(signed.signature));
    if let Some(recid) = signed.recid {
        println!("Recid:     {recid}");
    }
    if let Some(v) = v {
        println!("V:         {v}");
    }
    println!("Host nonce verified: the signature commits to the nonce this host chose.");
    Ok(())
}

pub fn build_transaction(keypath: Keypath, tx: EthTxJson) -> Result<EthTransaction> {
    let recipient = parse_hex(&tx.to).context("invalid 'to'")?;
    let recipient: [u8; 20] = recipient
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("'to' must be 20 bytes, got {}", recipient.len()))?;

    let base = match (tx.gas_price, tx.max_fee_per_gas, tx.max_priority_fee_per_gas) {
        (Some(gas_price), None, None) => EthTransaction::legacy(keypath, tx.chain_id)
            .with_gas_price(parse_quantity(&gas_price).context("invalid 'gas_price'")?),
        (None, Some(max_fee), Some(priority)) => EthTransaction::eip1559(keypath, tx.chain_id)
            .with_max_fee(parse_quantity(&max_fee).context("invalid 'max_fee_per_gas'")?)
            .with_max_priority_fee(
                parse_quantity(&priority).context("invalid 'max_priority_fee_per_gas'")?,
            ),
        _ => bail!(
            "give either 'gas_price' or both 'max_fee_per_gas' and 'max_priority_fee_per_gas'"
        ),
    };

    Ok(base
        .with_nonce(parse_quantity(&tx.nonce).context("invalid 'nonce'")?)
        .with_gas_limit(parse_quantity(&tx.gas_limit).context("invalid 'gas_limit'")?)
        .with_recipient(recipient)
        .with_value(parse_quantity(&tx.value).context("invalid 'value'")?)
        .with_data(parse_hex(&tx.data).context("invalid 'data'")?))
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let digits = value.trim().trim_start_matches("0x");
    if digits.len() % 2 == 1 {
        return Ok(hex::decode(format!("0{digits}"))?);
    }
    Ok(hex::decode(digits)?)
}

/// Big-endian quantity without leading zero bytes.
fn parse_quantity(value: &str) -> Result<Vec<u8>> {
    let bytes = parse_hex(value)?;
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    Ok(bytes[first..].to_vec())
}
