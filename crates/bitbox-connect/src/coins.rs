//! Digests the host recomputes to check device signatures.

use k256::{PublicKey, elliptic_curve::sec1::ToEncodedPoint};
use rlp::RlpStream;
use sha3::{Digest, Keccak256};

use crate::error::{DeviceError, DeviceResult};
use crate::types::{EthTransaction, EthTxType, TypedDataHash};

const EIP1559_TX_TYPE: u8 = 0x02;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Hash the device must sign for `tx`.
pub fn eth_sighash(tx: &EthTransaction) -> [u8; 32] {
    match tx.tx_type {
        EthTxType::Legacy => legacy_sighash(tx),
        EthTxType::Eip1559 => eip1559_sighash(tx),
    }
}

/// EIP-155 replay-protected legacy transaction hash.
fn legacy_sighash(tx: &EthTransaction) -> [u8; 32] {
    let mut rlp = RlpStream::new_list(9);
    append_quantity_bytes(&mut rlp, &tx.nonce);
    append_quantity_bytes(&mut rlp, &tx.gas_price);
    append_quantity_bytes(&mut rlp, &tx.gas_limit);
    rlp.append(&tx.recipient.as_slice());
    append_quantity_bytes(&mut rlp, &tx.value);
    rlp.append(&tx.data.as_slice());
    append_quantity_u64(&mut rlp, tx.chain_id);
    append_quantity_u64(&mut rlp, 0);
    append_quantity_u64(&mut rlp, 0);
    keccak256(rlp.out().as_ref())
}

fn eip1559_sighash(tx: &EthTransaction) -> [u8; 32] {
    let mut rlp = RlpStream::new_list(9);
    append_quantity_u64(&mut rlp, tx.chain_id);
    append_quantity_bytes(&mut rlp, &tx.nonce);
    append_quantity_bytes(&mut rlp, &tx.max_priority_fee);
    append_quantity_bytes(&mut rlp, &tx.max_fee);
    append_quantity_bytes(&mut rlp, &tx.gas_limit);
    rlp.append(&tx.recipient.as_slice());
    append_quantity_bytes(&mut rlp, &tx.value);
    rlp.append(&tx.data.as_slice());
    rlp.begin_list(0);

    let payload = rlp.out();
    let mut typed_payload = Vec::with_capacity(payload.len() + 1);
    typed_payload.push(EIP1559_TX_TYPE);
    typed_payload.extend_from_slice(payload.as_ref());
    keccak256(&typed_payload)
}

/// `keccak256(0x19 0x01 || domainSeparator || hashStruct(message))`.
pub fn eip712_sighash(typed: &TypedDataHash) -> [u8; 32] {
    let mut data = Vec::with_capacity(66);
    data.extend_from_slice(&[0x19, 0x01]);
    data.extend_from_slice(&typed.domain_separator_hash);
    data.extend_from_slice(&typed.message_hash);
    keccak256(&data)
}

fn append_quantity_u64(rlp: &mut RlpStream, value: u64) {
    append_quantity_bytes(rlp, &value.to_be_bytes());
}

fn append_quantity_bytes(rlp: &mut RlpStream, value: &[u8]) {
    let first = value
        .iter()
        .position(|byte| *byte != 0)
        .unwrap_or(value.len());
    let quantity: &[u8] = &value[first..];
    rlp.append(&quantity);
}

/// EIP-55 checksummed address for a SEC1 encoded public key.
pub fn eth_address(pubkey_sec1: &[u8]) -> DeviceResult<String> {
    let key = PublicKey::from_sec1_bytes(pubkey_sec1)
        .map_err(|_| DeviceError::protocol("invalid secp256k1 public key"))?;
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Ok(to_checksum_address(&hash[12..]))
}

pub fn to_checksum_address(address: &[u8]) -> String {
    let lower = hex::encode(address);
    let mut result = String::with_capacity(42);
    result.push_str("0x");
    let hash = keccak256(lower.as_bytes());

    for (idx, ch) in lower.chars().enumerate() {
        if ch.is_ascii_digit() {
            result.push(ch);
            continue;
        }

        let hash_byte = hash[idx / 2];
        let nibble = if idx % 2 == 0 {
            (hash_byte >> 4) & 0x0f
        } else {
            hash_byte & 0x0f
        };

        if nibble >= 8 {
            result.push(ch.to_ascii_uppercase());
        } else {
            result.push(ch);
        }
    }

    result
}

/// `v` as it goes into a legacy EIP-155 signature.
pub fn eip155_v(recid: u8, chain_id: u64) -> u64 {
    u64::from(recid) + 35 + chain_id * 2
}
