//! Protobuf messages carried inside sealed records.

use prost::Message;

pub const PROTOCOL_VERSION: u32 = 1;

/// Ethereum `data` bytes sent inline with the sign request; the rest is pulled
/// by the device with data requests.
pub const ETH_DATA_CHUNK_SIZE: usize = 1024;

#[derive(Clone, PartialEq, Message)]
pub struct RequestEnvelope {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub version: u32,
    #[prost(oneof = "request::Kind", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18")]
    pub kind: Option<request::Kind>,
}

pub mod request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "10")]
        DeviceInfo(super::DeviceInfoRequest),
        #[prost(message, tag = "11")]
        BtcPub(super::BtcPubRequest),
        #[prost(message, tag = "12")]
        EthPub(super::EthPubRequest),
        #[prost(message, tag = "13")]
        BtcSign(super::BtcSignRequest),
        #[prost(message, tag = "14")]
        EthSign(super::EthSignRequest),
        #[prost(message, tag = "15")]
        EthSignTyped(super::EthSignTypedRequest),
        #[prost(message, tag = "16")]
        AntiKleptoReveal(super::AntiKleptoRevealRequest),
        #[prost(message, tag = "17")]
        DataChunk(super::DataChunkRequest),
        #[prost(message, tag = "18")]
        ContinueResponse(super::ContinueResponseRequest),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ResponseEnvelope {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub version: u32,
    #[prost(oneof = "response::Kind", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
    pub kind: Option<response::Kind>,
}

pub mod response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "10")]
        DeviceInfo(super::DeviceInfoResponse),
        #[prost(message, tag = "11")]
        Pub(super::PubResponse),
        #[prost(message, tag = "12")]
        SignerCommitment(super::SignerCommitmentResponse),
        #[prost(message, tag = "13")]
        Signature(super::SignatureResponse),
        #[prost(message, tag = "14")]
        DataRequest(super::DataRequestResponse),
        #[prost(message, tag = "15")]
        Partial(super::PartialResponse),
        #[prost(message, tag = "16")]
        Progress(super::ProgressResponse),
        #[prost(message, tag = "17")]
        Error(super::ErrorResponse),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BtcCoin {
    Btc = 0,
    Tbtc = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BtcScriptType {
    P2wpkh = 0,
    P2tr = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EthTxType {
    Legacy = 0,
    Eip1559 = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProgressKind {
    ConfirmOnDevice = 0,
    ButtonPressed = 1,
    Busy = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Generic = 0,
    UserAbort = 1,
    Busy = 2,
    Locked = 3,
    InvalidInput = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct BtcPubRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub keypath: Vec<u32>,
    #[prost(enumeration = "BtcCoin", tag = "2")]
    pub coin: i32,
    #[prost(enumeration = "BtcScriptType", tag = "3")]
    pub script_type: i32,
    #[prost(bool, tag = "4")]
    pub display: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthPubRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub keypath: Vec<u32>,
    #[prost(uint64, tag = "2")]
    pub chain_id: u64,
    #[prost(bool, tag = "3")]
    pub display: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct BtcSignRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub keypath: Vec<u32>,
    #[prost(enumeration = "BtcCoin", tag = "2")]
    pub coin: i32,
    #[prost(enumeration = "BtcScriptType", tag = "3")]
    pub script_type: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub sighash: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub host_nonce_commitment: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthSignRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub keypath: Vec<u32>,
    #[prost(uint64, tag = "2")]
    pub chain_id: u64,
    #[prost(enumeration = "EthTxType", tag = "3")]
    pub tx_type: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub gas_price: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub max_priority_fee: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub max_fee: Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub gas_limit: Vec<u8>,
    #[prost(bytes = "vec", tag = "9")]
    pub recipient: Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub value: Vec<u8>,
    /// First chunk of `data`, at most [`ETH_DATA_CHUNK_SIZE`] bytes.
    #[prost(bytes = "vec", tag = "11")]
    pub data_initial_chunk: Vec<u8>,
    #[prost(uint32, tag = "12")]
    pub data_length: u32,
    #[prost(bytes = "vec", tag = "13")]
    pub host_nonce_commitment: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthSignTypedRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub keypath: Vec<u32>,
    #[prost(uint64, tag = "2")]
    pub chain_id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub domain_separator_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub message_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub host_nonce_commitment: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AntiKleptoRevealRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub host_nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DataChunkRequest {
    #[prost(uint32, tag = "1")]
    pub offset: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ContinueResponseRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoResponse {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(bool, tag = "3")]
    pub initialized: bool,
    #[prost(bool, tag = "4")]
    pub unlocked: bool,
    #[prost(bool, tag = "5")]
    pub supports_antiklepto: bool,
    #[prost(bytes = "vec", tag = "6")]
    pub attestation: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PubResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub pubkey: Vec<u8>,
    #[prost(string, tag = "2")]
    pub address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignerCommitmentResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub commitment: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignatureResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub recid: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DataRequestResponse {
    #[prost(uint32, tag = "1")]
    pub offset: u32,
    #[prost(uint32, tag = "2")]
    pub length: u32,
}

/// One piece of an encoded [`ResponseEnvelope`] too large to send at once.
#[derive(Clone, PartialEq, Message)]
pub struct PartialResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub more: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProgressResponse {
    #[prost(enumeration = "ProgressKind", tag = "1")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}
