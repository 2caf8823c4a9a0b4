use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::proto;

pub const HARDENED: u32 = 0x8000_0000;

/// BIP-32 derivation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Keypath(Vec<u32>);

impl Keypath {
    pub fn new(indices: Vec<u32>) -> Self {
        Self(indices)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.0.clone()
    }
}

impl FromStr for Keypath {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeviceError::InvalidRequest(format!("invalid keypath: {s}"));
        let mut parts = s.trim().split('/');
        if parts.next() != Some("m") {
            return Err(invalid());
        }
        let mut indices = Vec::new();
        for part in parts {
            let (digits, hardened) = match part.strip_suffix(['\'', 'h']) {
                Some(digits) => (digits, true),
                None => (part, false),
            };
            let index: u32 = digits.parse().map_err(|_| invalid())?;
            if index >= HARDENED {
                return Err(invalid());
            }
            indices.push(if hardened { index | HARDENED } else { index });
        }
        Ok(Self(indices))
    }
}

impl fmt::Display for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for index in &self.0 {
            if index & HARDENED != 0 {
                write!(f, "/{}'", index & !HARDENED)?;
            } else {
                write!(f, "/{index}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtcCoin {
    Btc,
    Tbtc,
}

impl From<BtcCoin> for proto::BtcCoin {
    fn from(coin: BtcCoin) -> Self {
        match coin {
            BtcCoin::Btc => Self::Btc,
            BtcCoin::Tbtc => Self::Tbtc,
        }
    }
}

/// Output script type; also selects the signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtcScriptType {
    /// Native segwit v0, ECDSA.
    P2wpkh,
    /// Taproot key path, BIP-340 Schnorr.
    P2tr,
}

impl From<BtcScriptType> for proto::BtcScriptType {
    fn from(script: BtcScriptType) -> Self {
        match script {
            BtcScriptType::P2wpkh => Self::P2wpkh,
            BtcScriptType::P2tr => Self::P2tr,
        }
    }
}

impl From<proto::BtcScriptType> for BtcScriptType {
    fn from(script: proto::BtcScriptType) -> Self {
        match script {
            proto::BtcScriptType::P2wpkh => Self::P2wpkh,
            proto::BtcScriptType::P2tr => Self::P2tr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    Ecdsa,
    Schnorr,
}

impl BtcScriptType {
    pub fn scheme(self) -> SignatureScheme {
        match self {
            Self::P2wpkh => SignatureScheme::Ecdsa,
            Self::P2tr => SignatureScheme::Schnorr,
        }
    }
}

/// One Bitcoin input signature: the caller computed the sighash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtcSignInput {
    pub keypath: Keypath,
    pub coin: BtcCoin,
    pub script_type: BtcScriptType,
    pub sighash: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EthTxType {
    Legacy,
    Eip1559,
}

impl From<EthTxType> for proto::EthTxType {
    fn from(tx_type: EthTxType) -> Self {
        match tx_type {
            EthTxType::Legacy => Self::Legacy,
            EthTxType::Eip1559 => Self::Eip1559,
        }
    }
}

impl From<proto::EthTxType> for EthTxType {
    fn from(tx_type: proto::EthTxType) -> Self {
        match tx_type {
            proto::EthTxType::Legacy => Self::Legacy,
            proto::EthTxType::Eip1559 => Self::Eip1559,
        }
    }
}

/// Ethereum transaction. Quantities are big-endian bytes without a fixed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTransaction {
    pub keypath: Keypath,
    pub chain_id: u64,
    pub tx_type: EthTxType,
    pub nonce: Vec<u8>,
    /// Legacy only.
    pub gas_price: Vec<u8>,
    /// EIP-1559 only.
    pub max_priority_fee: Vec<u8>,
    /// EIP-1559 only.
    pub max_fee: Vec<u8>,
    pub gas_limit: Vec<u8>,
    pub recipient: [u8; 20],
    pub value: Vec<u8>,
    pub data: Vec<u8>,
}

impl EthTransaction {
    pub fn legacy(keypath: Keypath, chain_id: u64) -> Self {
        Self {
            keypath,
            chain_id,
            tx_type: EthTxType::Legacy,
            nonce: Vec::new(),
            gas_price: Vec::new(),
            max_priority_fee: Vec::new(),
            max_fee: Vec::new(),
            gas_limit: Vec::new(),
            recipient: [0u8; 20],
            value: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn eip1559(keypath: Keypath, chain_id: u64) -> Self {
        Self {
            tx_type: EthTxType::Eip1559,
            ..Self::legacy(keypath, chain_id)
        }
    }

    pub fn with_nonce(mut self, nonce: Vec<u8>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_gas_price(mut self, gas_price: Vec<u8>) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn with_max_priority_fee(mut self, fee: Vec<u8>) -> Self {
        self.max_priority_fee = fee;
        self
    }

    pub fn with_max_fee(mut self, fee: Vec<u8>) -> Self {
        self.max_fee = fee;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: Vec<u8>) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_recipient(mut self, recipient: [u8; 20]) -> Self {
        self.recipient = recipient;
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// EIP-712 typed data, already hashed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedDataHash {
    pub keypath: Keypath,
    pub chain_id: u64,
    pub domain_separator_hash: [u8; 32],
    pub message_hash: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub version: String,
    pub initialized: bool,
    pub unlocked: bool,
    pub supports_antiklepto: bool,
    #[serde(with = "hex")]
    pub attestation: Vec<u8>,
}

impl From<proto::DeviceInfoResponse> for DeviceInfo {
    fn from(info: proto::DeviceInfoResponse) -> Self {
        Self {
            name: info.name,
            version: info.version,
            initialized: info.initialized,
            unlocked: info.unlocked,
            supports_antiklepto: info.supports_antiklepto,
            attestation: info.attestation,
        }
    }
}

/// Out-of-band status reported while a call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    ConfirmOnDevice,
    ButtonPressed,
    Busy,
}

impl From<proto::ProgressKind> for Progress {
    fn from(kind: proto::ProgressKind) -> Self {
        match kind {
            proto::ProgressKind::ConfirmOnDevice => Self::ConfirmOnDevice,
            proto::ProgressKind::ButtonPressed => Self::ButtonPressed,
            proto::ProgressKind::Busy => Self::Busy,
        }
    }
}

/// A public key together with the address the device displayed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub pubkey: Vec<u8>,
    pub address: Option<String>,
}
