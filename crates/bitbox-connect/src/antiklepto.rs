//! Host side of the anti-klepto signing protocol.
//!
//! A session runs in three strictly ordered phases: the host commits to a
//! secret nonce in the sign request, the device answers with a commitment to
//! its own nonce, and only then does the host reveal its nonce and receive
//! the signature. The signature is checked locally before it is handed out.

use bbp_crypto::{
    AntiKleptoError, HostNonce, SignerCommitment,
    antiklepto::{check_recovery, verify_ecdsa, verify_schnorr},
};
use tracing::{debug, info, warn};

use crate::codec::{DataStreamer, DeviceRequest, DeviceResponse, response_kind};
use crate::coins;
use crate::error::{DeviceError, DeviceResult};
use crate::mux::{CommandInvoker, SessionSource};
use crate::proto;
use crate::types::{
    BtcSignInput, EthTransaction, EthTxType, SignatureScheme, TypedDataHash,
};

/// The host nonce of one signing session and the device commitment it is paired with.
#[derive(Debug)]
pub struct CommitmentPair {
    host_nonce: HostNonce,
    signer: Option<SignerCommitment>,
}

impl Default for CommitmentPair {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitmentPair {
    /// Draws a fresh host nonce.
    pub fn new() -> Self {
        Self::from_host_nonce(HostNonce::random())
    }

    pub fn from_host_nonce(host_nonce: HostNonce) -> Self {
        Self {
            host_nonce,
            signer: None,
        }
    }

    pub fn host_commitment(&self) -> [u8; 32] {
        self.host_nonce.commitment()
    }

    pub fn host_nonce(&self) -> &HostNonce {
        &self.host_nonce
    }

    pub fn signer_commitment(&self) -> Option<&SignerCommitment> {
        self.signer.as_ref()
    }

    /// Records the device commitment. Only one is accepted per session.
    pub fn record_signer_commitment(&mut self, bytes: &[u8]) -> DeviceResult<()> {
        if self.signer.is_some() {
            return Err(DeviceError::CommitmentOrderViolation(
                "duplicate signer commitment",
            ));
        }
        let commitment = SignerCommitment::parse(bytes).map_err(|err| {
            DeviceError::protocol(format!("invalid signer commitment: {err}"))
        })?;
        self.signer = Some(commitment);
        Ok(())
    }

    /// The reveal request. Fails unless the device has already committed.
    pub fn reveal(&self) -> DeviceResult<DeviceRequest> {
        if self.signer.is_none() {
            return Err(DeviceError::CommitmentOrderViolation(
                "host nonce revealed before signer commitment",
            ));
        }
        Ok(DeviceRequest::AntiKleptoReveal(
            proto::AntiKleptoRevealRequest {
                host_nonce: self.host_nonce.as_bytes().to_vec(),
            },
        ))
    }
}

/// What is being signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningPayload {
    EthTransaction(EthTransaction),
    EthTypedData(TypedDataHash),
    Btc(BtcSignInput),
}

impl SigningPayload {
    pub fn scheme(&self) -> SignatureScheme {
        match self {
            Self::EthTransaction(_) | Self::EthTypedData(_) => SignatureScheme::Ecdsa,
            Self::Btc(input) => input.script_type.scheme(),
        }
    }

    /// The 32-byte message the device is expected to sign.
    pub fn digest(&self) -> [u8; 32] {
        match self {
            Self::EthTransaction(tx) => coins::eth_sighash(tx),
            Self::EthTypedData(typed) => coins::eip712_sighash(typed),
            Self::Btc(input) => input.sighash,
        }
    }

    fn has_recovery_id(&self) -> bool {
        !matches!(self, Self::Btc(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningSession {
    pub payload: SigningPayload,
    /// Compressed SEC1 key the signature must verify against.
    pub expected_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    /// `r || s` for ECDSA, `R.x || s` for Schnorr.
    pub signature: [u8; 64],
    /// Ethereum only.
    pub recid: Option<u8>,
    pub scheme: SignatureScheme,
    pub digest: [u8; 32],
}

/// Runs signing sessions with exclusive use of the device.
#[derive(Debug, Clone)]
pub struct AntiKleptoSigner<D> {
    device: D,
}

impl<D: SessionSource> AntiKleptoSigner<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub async fn sign(&self, session: &SigningSession) -> DeviceResult<SignedPayload> {
        let lease = self.device.begin_session().await;
        run_session(&lease, session).await
    }
}

/// Drives one session over `invoker`, which must not be shared with other callers
/// for the duration.
pub async fn run_session<I: CommandInvoker + ?Sized>(
    invoker: &I,
    session: &SigningSession,
) -> DeviceResult<SignedPayload> {
    let mut pair = CommitmentPair::new();
    let (request, mut streamer) = sign_request(&session.payload, pair.host_commitment())?;
    debug!(scheme = ?session.payload.scheme(), "starting signing session");

    let mut response = invoker.invoke(request).await?;
    loop {
        match response {
            DeviceResponse::DataRequest(data_request) => {
                let streamer = streamer.as_mut().ok_or_else(|| {
                    DeviceError::protocol("data request for a payload without streamed data")
                })?;
                let chunk = streamer.next_chunk(data_request.offset, data_request.length)?;
                response = invoker.invoke(chunk).await?;
            }
            DeviceResponse::SignerCommitment(commitment) => {
                pair.record_signer_commitment(&commitment.commitment)?;
                break;
            }
            DeviceResponse::Signature(_) => {
                warn!("device returned a signature before committing to its nonce");
                return Err(DeviceError::CommitmentOrderViolation(
                    "signature before signer commitment",
                ));
            }
            other => {
                return Err(DeviceError::protocol(format!(
                    "unexpected {:?} while waiting for the signer commitment",
                    response_kind(&other)
                )));
            }
        }
    }
    if let Some(streamer) = &streamer
        && !streamer.is_complete()
    {
        return Err(DeviceError::protocol(
            "device committed before receiving all data",
        ));
    }

    let signature = match invoker.invoke(pair.reveal()?).await? {
        DeviceResponse::Signature(signature) => signature,
        DeviceResponse::SignerCommitment(_) => {
            warn!("device sent a second signer commitment instead of a signature");
            return Err(DeviceError::CommitmentOrderViolation(
                "second signer commitment after reveal",
            ));
        }
        other => {
            return Err(DeviceError::protocol(format!(
                "unexpected {:?} in answer to the nonce reveal",
                response_kind(&other)
            )));
        }
    };

    let signed = verify(&pair, session, &signature)?;
    info!(scheme = ?signed.scheme, "signature verified against host nonce");
    Ok(signed)
}

fn sign_request(
    payload: &SigningPayload,
    host_commitment: [u8; 32],
) -> DeviceResult<(DeviceRequest, Option<DataStreamer>)> {
    let host_nonce_commitment = host_commitment.to_vec();
    let request = match payload {
        SigningPayload::EthTransaction(tx) => {
            let data_length = u32::try_from(tx.data.len())
                .map_err(|_| DeviceError::InvalidRequest("transaction data too large".into()))?;
            let (streamer, initial) = DataStreamer::new(tx.data.clone());
            let legacy = tx.tx_type == EthTxType::Legacy;
            let request = DeviceRequest::EthSign(proto::EthSignRequest {
                keypath: tx.keypath.to_vec(),
                chain_id: tx.chain_id,
                tx_type: proto::EthTxType::from(tx.tx_type) as i32,
                nonce: tx.nonce.clone(),
                gas_price: if legacy { tx.gas_price.clone() } else { Vec::new() },
                max_priority_fee: if legacy { Vec::new() } else { tx.max_priority_fee.clone() },
                max_fee: if legacy { Vec::new() } else { tx.max_fee.clone() },
                gas_limit: tx.gas_limit.clone(),
                recipient: tx.recipient.to_vec(),
                value: tx.value.clone(),
                data_initial_chunk: initial,
                data_length,
                host_nonce_commitment,
            });
            let streamer = (!streamer.is_complete()).then_some(streamer);
            return Ok((request, streamer));
        }
        SigningPayload::EthTypedData(typed) => {
            DeviceRequest::EthSignTyped(proto::EthSignTypedRequest {
                keypath: typed.keypath.to_vec(),
                chain_id: typed.chain_id,
                domain_separator_hash: typed.domain_separator_hash.to_vec(),
                message_hash: typed.message_hash.to_vec(),
                host_nonce_commitment,
            })
        }
        SigningPayload::Btc(input) => DeviceRequest::BtcSign(proto::BtcSignRequest {
            keypath: input.keypath.to_vec(),
            coin: proto::BtcCoin::from(input.coin) as i32,
            script_type: proto::BtcScriptType::from(input.script_type) as i32,
            sighash: input.sighash.to_vec(),
            host_nonce_commitment,
        }),
    };
    Ok((request, None))
}

fn verify(
    pair: &CommitmentPair,
    session: &SigningSession,
    response: &proto::SignatureResponse,
) -> DeviceResult<SignedPayload> {
    let commitment = pair
        .signer_commitment()
        .ok_or(DeviceError::CommitmentOrderViolation(
            "signature without signer commitment",
        ))?;
    let signature: [u8; 64] = response
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| AntiKleptoError::MalformedSignature)?;
    let digest = session.payload.digest();
    let host_nonce = pair.host_nonce().as_bytes();
    let scheme = session.payload.scheme();

    let result = match scheme {
        SignatureScheme::Ecdsa => verify_ecdsa(
            &session.expected_pubkey,
            &digest,
            &signature,
            commitment,
            host_nonce,
        ),
        SignatureScheme::Schnorr => {
            let xonly: [u8; 32] = session
                .expected_pubkey
                .get(1..33)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| DeviceError::InvalidRequest("expected a compressed public key".into()))?;
            verify_schnorr(&xonly, &digest, &signature, commitment, host_nonce)
        }
    };
    if let Err(err) = result {
        warn!("device signature rejected: {err}");
        return Err(err.into());
    }

    let recid = if session.payload.has_recovery_id() {
        let recid = u8::try_from(response.recid)
            .ok()
            .filter(|recid| *recid <= 1)
            .ok_or(AntiKleptoError::MalformedSignature)?;
        check_recovery(&session.expected_pubkey, &digest, &signature, recid)?;
        Some(recid)
    } else {
        None
    };

    Ok(SignedPayload {
        signature,
        recid,
        scheme,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BtcCoin, BtcScriptType, Keypath};
    use bbp_crypto::antiklepto::signer;
    use parking_lot::Mutex;

    const SECRET: [u8; 32] = [0x11; 32];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Honest,
        SignatureFirst,
        DuplicateCommitment,
        TamperNonce,
        WrongKey,
    }

    /// Answers sign requests the way a device would, with scripted faults.
    struct FakeDevice {
        mode: Mode,
        digest: [u8; 32],
        schnorr: bool,
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        nonce_secret: [u8; 32],
        data: Vec<u8>,
        data_length: usize,
        requests: Vec<&'static str>,
    }

    impl FakeDevice {
        fn new(mode: Mode, digest: [u8; 32], schnorr: bool) -> Self {
            Self {
                mode,
                digest,
                schnorr,
                state: Mutex::new(FakeState {
                    nonce_secret: rand::random(),
                    ..Default::default()
                }),
            }
        }

        fn pubkey() -> Vec<u8> {
            signer::public_key(&SECRET).unwrap().to_vec()
        }

        fn commitment(&self) -> DeviceResponse {
            let nonce_secret = self.state.lock().nonce_secret;
            DeviceResponse::SignerCommitment(proto::SignerCommitmentResponse {
                commitment: signer::commit(&nonce_secret).unwrap().as_bytes().to_vec(),
            })
        }

        fn signature(&self, host_nonce: &[u8]) -> DeviceResponse {
            let mut host_nonce: [u8; 32] = host_nonce.try_into().unwrap();
            if self.mode == Mode::TamperNonce {
                host_nonce[0] ^= 0x01;
            }
            let secret = if self.mode == Mode::WrongKey { [0x22; 32] } else { SECRET };
            let nonce_secret = self.state.lock().nonce_secret;
            let (signature, recid) = if self.schnorr {
                let sig =
                    signer::sign_schnorr(&secret, &self.digest, &nonce_secret, &host_nonce)
                        .unwrap();
                (sig, 0)
            } else {
                signer::sign_ecdsa(&secret, &self.digest, &nonce_secret, &host_nonce).unwrap()
            };
            DeviceResponse::Signature(proto::SignatureResponse {
                signature: signature.to_vec(),
                recid: u32::from(recid),
            })
        }

        fn after_data(&self) -> DeviceResponse {
            if self.mode == Mode::SignatureFirst {
                self.signature(&[0u8; 32])
            } else {
                self.commitment()
            }
        }

        fn next_data_request(&self) -> Option<DeviceResponse> {
            let state = self.state.lock();
            (state.data.len() < state.data_length).then(|| {
                DeviceResponse::DataRequest(proto::DataRequestResponse {
                    offset: state.data.len() as u32,
                    length: (state.data_length - state.data.len()).min(1024) as u32,
                })
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandInvoker for FakeDevice {
        async fn invoke(&self, request: DeviceRequest) -> DeviceResult<DeviceResponse> {
            match request {
                DeviceRequest::EthSign(sign) => {
                    {
                        let mut state = self.state.lock();
                        state.requests.push("eth_sign");
                        state.data = sign.data_initial_chunk;
                        state.data_length = sign.data_length as usize;
                    }
                    Ok(self.next_data_request().unwrap_or_else(|| self.after_data()))
                }
                DeviceRequest::DataChunk(chunk) => {
                    {
                        let mut state = self.state.lock();
                        state.requests.push("data_chunk");
                        assert_eq!(chunk.offset as usize, state.data.len());
                        state.data.extend_from_slice(&chunk.data);
                    }
                    Ok(self.next_data_request().unwrap_or_else(|| self.after_data()))
                }
                DeviceRequest::BtcSign(_) | DeviceRequest::EthSignTyped(_) => {
                    self.state.lock().requests.push("sign");
                    Ok(self.after_data())
                }
                DeviceRequest::AntiKleptoReveal(reveal) => {
                    self.state.lock().requests.push("reveal");
                    if self.mode == Mode::DuplicateCommitment {
                        return Ok(self.commitment());
                    }
                    Ok(self.signature(&reveal.host_nonce))
                }
                _ => Err(DeviceError::protocol("unexpected request")),
            }
        }
    }

    fn btc_session(script_type: BtcScriptType) -> SigningSession {
        SigningSession {
            payload: SigningPayload::Btc(BtcSignInput {
                keypath: "m/84'/0'/0'/0/0".parse().unwrap(),
                coin: BtcCoin::Btc,
                script_type,
                sighash: [0x42; 32],
            }),
            expected_pubkey: FakeDevice::pubkey(),
        }
    }

    #[tokio::test]
    async fn honest_btc_ecdsa_session_verifies() {
        let session = btc_session(BtcScriptType::P2wpkh);
        let device = FakeDevice::new(Mode::Honest, [0x42; 32], false);
        let signed = run_session(&device, &session).await.unwrap();
        assert_eq!(signed.scheme, SignatureScheme::Ecdsa);
        assert_eq!(signed.recid, None);
        assert_eq!(device.state.lock().requests, vec!["sign", "reveal"]);
    }

    #[tokio::test]
    async fn honest_taproot_session_verifies() {
        let session = btc_session(BtcScriptType::P2tr);
        let device = FakeDevice::new(Mode::Honest, [0x42; 32], true);
        let signed = run_session(&device, &session).await.unwrap();
        assert_eq!(signed.scheme, SignatureScheme::Schnorr);
    }

    #[tokio::test]
    async fn eth_transaction_streams_data_before_commitment() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let tx = EthTransaction::eip1559(Keypath::default(), 1)
            .with_nonce(vec![1])
            .with_max_fee(vec![0x10])
            .with_gas_limit(vec![0x52, 0x08])
            .with_data(data.clone());
        let digest = coins::eth_sighash(&tx);
        let session = SigningSession {
            payload: SigningPayload::EthTransaction(tx),
            expected_pubkey: FakeDevice::pubkey(),
        };
        let device = FakeDevice::new(Mode::Honest, digest, false);
        let signed = run_session(&device, &session).await.unwrap();
        assert!(signed.recid.is_some());
        assert_eq!(signed.digest, digest);

        let state = device.state.lock();
        assert_eq!(state.data, data);
        assert_eq!(
            state.requests,
            vec!["eth_sign", "data_chunk", "data_chunk", "reveal"]
        );
    }

    #[tokio::test]
    async fn signature_before_commitment_is_rejected() {
        let session = btc_session(BtcScriptType::P2wpkh);
        let device = FakeDevice::new(Mode::SignatureFirst, [0x42; 32], false);
        let err = run_session(&device, &session).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommitmentOrderViolation(_)));
        assert_eq!(device.state.lock().requests, vec!["sign"]);
    }

    #[tokio::test]
    async fn signature_before_commitment_after_data_is_rejected() {
        let tx = EthTransaction::legacy(Keypath::default(), 1).with_data(vec![7u8; 2000]);
        let digest = coins::eth_sighash(&tx);
        let session = SigningSession {
            payload: SigningPayload::EthTransaction(tx),
            expected_pubkey: FakeDevice::pubkey(),
        };
        let device = FakeDevice::new(Mode::SignatureFirst, digest, false);
        let err = run_session(&device, &session).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommitmentOrderViolation(_)));
        assert!(!device.state.lock().requests.contains(&"reveal"));
    }

    #[tokio::test]
    async fn second_commitment_at_reveal_is_rejected() {
        let session = btc_session(BtcScriptType::P2wpkh);
        let device = FakeDevice::new(Mode::DuplicateCommitment, [0x42; 32], false);
        let err = run_session(&device, &session).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommitmentOrderViolation(_)));
    }

    #[tokio::test]
    async fn tampered_host_nonce_fails_verification() {
        for script_type in [BtcScriptType::P2wpkh, BtcScriptType::P2tr] {
            let session = btc_session(script_type);
            let schnorr = script_type == BtcScriptType::P2tr;
            let device = FakeDevice::new(Mode::TamperNonce, [0x42; 32], schnorr);
            let err = run_session(&device, &session).await.unwrap_err();
            assert!(matches!(
                err,
                DeviceError::SignatureVerificationFailed(AntiKleptoError::NonceMismatch)
            ));
        }
    }

    #[tokio::test]
    async fn signature_from_other_key_fails_verification() {
        let typed = TypedDataHash {
            keypath: Keypath::default(),
            chain_id: 1,
            domain_separator_hash: [3; 32],
            message_hash: [4; 32],
        };
        let digest = coins::eip712_sighash(&typed);
        let session = SigningSession {
            payload: SigningPayload::EthTypedData(typed),
            expected_pubkey: FakeDevice::pubkey(),
        };
        let device = FakeDevice::new(Mode::WrongKey, digest, false);
        let err = run_session(&device, &session).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::SignatureVerificationFailed(AntiKleptoError::VerificationFailed)
        ));
    }

    #[test]
    fn reveal_requires_commitment() {
        let mut pair = CommitmentPair::new();
        assert!(matches!(
            pair.reveal(),
            Err(DeviceError::CommitmentOrderViolation(_))
        ));
        let commitment = signer::commit(&[5u8; 32]).unwrap();
        pair.record_signer_commitment(commitment.as_bytes()).unwrap();
        assert!(pair.reveal().is_ok());
        assert!(matches!(
            pair.record_signer_commitment(commitment.as_bytes()),
            Err(DeviceError::CommitmentOrderViolation(_))
        ));
    }

    #[test]
    fn sessions_use_fresh_nonces() {
        let first = CommitmentPair::new();
        let second = CommitmentPair::new();
        assert_ne!(first.host_commitment(), second.host_commitment());
    }

    #[test]
    fn malformed_commitment_is_a_protocol_violation() {
        let mut pair = CommitmentPair::new();
        assert!(matches!(
            pair.record_signer_commitment(&[0x04; 33]),
            Err(DeviceError::ProtocolViolation(_))
        ));
        assert!(pair.signer_commitment().is_none());
    }
}
