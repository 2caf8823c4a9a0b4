//! Device side of the protocol, driven by a scripted [`Behaviour`].

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bbp_codec::DEFAULT_MAX_PAYLOAD;
use bbp_core::{
    ChannelConfig, ChannelError, FramedLink, RecordLayer, TAG_ENCRYPTED, TAG_HANDSHAKE,
    handshake::{HandshakeInit, HandshakeReply, PROTOCOL_VERSION, PairingAck, PairingConfirm},
};
use bbp_crypto::{
    CipherSuite, PairingCode, X25519AesGcmSuite, antiklepto, derive_session_secrets,
    handshake_hash,
    pairing::{digests_match, verify_resume_mac},
};
use bitbox_connect::{
    BtcScriptType, DeviceRequest, DeviceResponse, EthTransaction, EthTxType, Keypath,
    RequestKind, ResponseKind,
    codec::{self, decode_request, encode_response, request_kind, split_response},
    coins, proto,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::SimLink;

/// How the simulated firmware misbehaves, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behaviour {
    #[default]
    Honest,
    /// Answers sign requests with a signature instead of a nonce commitment.
    SignatureBeforeCommitment,
    /// Answers the nonce reveal with another commitment.
    DuplicateCommitment,
    /// Signs with a host nonce that differs in one byte from the revealed one.
    TamperHostNonce,
    /// Confirms a pairing code other than the one it derived.
    WrongPairingCode,
    /// Declines every pairing.
    RejectPairing,
    /// Never answers key or signing requests.
    Silent,
    /// Reports busy on the first signing request.
    BusyOnce,
    /// The user declines every signing request on the device.
    UserAbort,
    /// Sends a progress update of an unknown kind ahead of every public key.
    UnknownProgress,
    /// Answers public key requests with a stray handshake frame.
    StrayHandshake,
}

/// Observable traffic, in the order the device handled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Handshake { resumed: bool },
    Paired,
    Request { id: u32, kind: RequestKind },
    Response { id: u32, kind: ResponseKind },
}

struct Memory {
    remembered: Option<ChannelConfig>,
    last_code: Option<PairingCode>,
    transcript: Vec<TranscriptEvent>,
}

/// A simulated device. Clones share keys, remembered channels and transcript,
/// so a "reconnect" is another [`SimulatedDevice::spawn`] on a new link.
#[derive(Clone)]
pub struct SimulatedDevice {
    seed: [u8; 32],
    behaviour: Behaviour,
    supports_resume: bool,
    attestation: Vec<u8>,
    piece_len: usize,
    confirm_delay: Duration,
    unlocked: Arc<AtomicBool>,
    busy_pending: Arc<AtomicBool>,
    memory: Arc<Mutex<Memory>>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("behaviour", &self.behaviour)
            .field("unlocked", &self.is_unlocked())
            .finish_non_exhaustive()
    }
}

impl SimulatedDevice {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            behaviour: Behaviour::Honest,
            supports_resume: true,
            attestation: Vec::new(),
            piece_len: 4096,
            confirm_delay: Duration::ZERO,
            unlocked: Arc::new(AtomicBool::new(true)),
            busy_pending: Arc::new(AtomicBool::new(true)),
            memory: Arc::new(Mutex::new(Memory {
                remembered: None,
                last_code: None,
                transcript: Vec::new(),
            })),
        }
    }

    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn with_resume(mut self, supported: bool) -> Self {
        self.supports_resume = supported;
        self
    }

    /// Attestation blob returned in device info; large blobs are sent as partial responses.
    pub fn with_attestation(mut self, attestation: Vec<u8>) -> Self {
        self.attestation = attestation;
        self
    }

    /// Largest encoded response sent in one piece.
    pub fn with_piece_len(mut self, piece_len: usize) -> Self {
        self.piece_len = piece_len.max(1);
        self
    }

    /// Time the simulated user takes to confirm after a progress update.
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    pub fn locked(self) -> Self {
        self.unlocked.store(false, Ordering::SeqCst);
        self
    }

    pub fn behaviour(&self) -> Behaviour {
        self.behaviour
    }

    pub fn unlock(&self) {
        self.unlocked.store(true, Ordering::SeqCst);
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    pub fn last_pairing_code(&self) -> Option<PairingCode> {
        self.memory.lock().last_code
    }

    pub fn remembers_channel(&self) -> bool {
        self.memory.lock().remembered.is_some()
    }

    /// Drops the remembered channel, as a device factory reset would.
    pub fn forget_channel(&self) {
        self.memory.lock().remembered = None;
    }

    pub fn transcript(&self) -> Vec<TranscriptEvent> {
        self.memory.lock().transcript.clone()
    }

    /// Compressed public key for `keypath`.
    pub fn public_key(&self, keypath: &Keypath) -> Vec<u8> {
        antiklepto::signer::public_key(&self.secret_key(keypath.as_slice()))
            .map(|key| key.to_vec())
            .unwrap_or_default()
    }

    fn secret_key(&self, keypath: &[u32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        for index in keypath {
            hasher.update(index.to_be_bytes());
        }
        hasher.finalize().into()
    }

    fn record(&self, event: TranscriptEvent) {
        self.memory.lock().transcript.push(event);
    }

    /// Serves `link` until it closes.
    pub fn spawn(&self, link: SimLink) -> JoinHandle<()> {
        let device = self.clone();
        tokio::spawn(async move { device.serve(link).await })
    }

    async fn serve(self, link: SimLink) {
        let mut framed = FramedLink::new(link, DEFAULT_MAX_PAYLOAD);
        let mut session: Option<Session> = None;
        loop {
            let payload = match framed.recv().await {
                Ok(payload) => payload,
                Err(ChannelError::Disconnected) => break,
                Err(err) => {
                    warn!("simulator dropping malformed frames: {err}");
                    session = None;
                    continue;
                }
            };
            let result = match payload.tag {
                TAG_HANDSHAKE => self
                    .handshake(&mut framed, &payload.bytes)
                    .await
                    .map(|next| session = next),
                TAG_ENCRYPTED => {
                    let Some(active) = session.as_mut() else {
                        debug!("simulator ignoring record without a channel");
                        continue;
                    };
                    match self.on_record(&mut framed, active, &payload.bytes).await {
                        Ok(true) => Ok(()),
                        Ok(false) => {
                            session = None;
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
                other => {
                    debug!("simulator ignoring tag {other:#04x}");
                    Ok(())
                }
            };
            if let Err(err) = result {
                if err.is_disconnect() {
                    break;
                }
                warn!("simulator channel reset: {err}");
                session = None;
            }
        }
        debug!("simulated device stopped");
    }

    async fn handshake(
        &self,
        framed: &mut FramedLink<SimLink>,
        bytes: &[u8],
    ) -> Result<Option<Session>, ChannelError> {
        let init = match HandshakeInit::decode(bytes) {
            Ok(init) => init,
            Err(err) => {
                warn!("simulator rejecting handshake: {err}");
                return Ok(None);
            }
        };
        let remembered = self.memory.lock().remembered.clone();
        let resumed_config = match (&init.resume, remembered) {
            (Some(request), Some(config))
                if self.supports_resume
                    && request.channel_id == config.channel
                    && verify_resume_mac(
                        &config.authentication,
                        &init.host_ephemeral,
                        &request.channel_id,
                        &request.mac,
                    ) =>
            {
                Some(config)
            }
            _ => None,
        };
        let resumed = resumed_config.is_some();
        let channel_id = resumed_config
            .as_ref()
            .map(|config| config.channel)
            .unwrap_or_else(rand::random);
        let resume_secret = resumed_config.map(|config| config.encryption);

        let (device_priv, device_pub) = X25519AesGcmSuite::generate_keypair();
        let reply = HandshakeReply {
            version: PROTOCOL_VERSION,
            device_ephemeral: device_pub,
            channel_id,
            resumed,
            supports_resume: self.supports_resume,
        };
        framed.send(TAG_HANDSHAKE, &reply.encode()).await?;
        self.record(TranscriptEvent::Handshake { resumed });

        let shared = X25519AesGcmSuite::ecdh(&device_priv, &init.host_ephemeral)?;
        let hh = handshake_hash(&init.host_ephemeral, &device_pub, &channel_id, resumed);
        let secrets = derive_session_secrets::<X25519AesGcmSuite>(
            &shared,
            &channel_id,
            &hh,
            resume_secret.as_ref(),
        )?;
        let mut code = PairingCode::from_seed(&secrets.pairing_seed);
        self.memory.lock().last_code = Some(code);
        if self.behaviour == Behaviour::WrongPairingCode {
            let mut seed = secrets.pairing_seed;
            seed[7] ^= 0x01;
            code = PairingCode::from_seed(&seed);
        }

        Ok(Some(Session {
            record: RecordLayer::device(secrets.keys.clone(), channel_id),
            handshake_hash: hh,
            code,
            confirmed: false,
            pending_config: (!resumed && self.supports_resume)
                .then(|| ChannelConfig::new(channel_id, &secrets.persistence)),
            signing: SignState::Idle,
            pieces: VecDeque::new(),
        }))
    }

    /// Returns `false` when the session must be dropped.
    async fn on_record(
        &self,
        framed: &mut FramedLink<SimLink>,
        session: &mut Session,
        envelope: &[u8],
    ) -> Result<bool, ChannelError> {
        let plaintext = session.record.open(envelope)?;
        if !session.confirmed {
            let confirm = PairingConfirm::decode(&plaintext)?;
            if !confirm.accepted {
                info!("host declined pairing");
                return Ok(false);
            }
            let digest = session.code.confirmation_digest(&session.handshake_hash);
            let codes_match = digests_match(&confirm.digest, &digest);
            if !codes_match {
                warn!("host confirmed a different pairing code");
            }
            let accepted = codes_match && self.behaviour != Behaviour::RejectPairing;
            let ack = PairingAck { accepted, digest };
            let sealed = session.record.seal(&ack.encode())?;
            framed.send(TAG_ENCRYPTED, &sealed).await?;
            if !accepted {
                return Ok(false);
            }
            session.confirmed = true;
            if let Some(config) = session.pending_config.take() {
                self.memory.lock().remembered = Some(config);
            }
            self.record(TranscriptEvent::Paired);
            return Ok(true);
        }

        let (id, request) = match decode_request(&plaintext) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("simulator cannot decode request: {err}");
                return Ok(true);
            }
        };
        let kind = request_kind(&request);
        self.record(TranscriptEvent::Request { id, kind });
        let key_request = matches!(kind, RequestKind::EthPub | RequestKind::BtcPub);
        if key_request && self.behaviour == Behaviour::StrayHandshake {
            framed.send(TAG_HANDSHAKE, &[0xff]).await?;
            return Ok(true);
        }
        let mut responses = self.respond(session, id, request);
        if key_request && self.behaviour == Behaviour::UnknownProgress {
            responses.insert(
                0,
                Outgoing::Response(DeviceResponse::Progress(proto::ProgressResponse {
                    kind: 99,
                })),
            );
        }
        for response in responses {
            let progress = matches!(
                response,
                Outgoing::Response(DeviceResponse::Progress(_))
            );
            self.send_response(framed, session, id, response).await?;
            if progress && !self.confirm_delay.is_zero() {
                tokio::time::sleep(self.confirm_delay).await;
            }
        }
        Ok(true)
    }

    async fn send_response(
        &self,
        framed: &mut FramedLink<SimLink>,
        session: &mut Session,
        id: u32,
        response: Outgoing,
    ) -> Result<(), ChannelError> {
        let (kind, bytes) = match response {
            Outgoing::Response(response) => {
                let encoded = encode_response(id, response.clone());
                if encoded.len() > self.piece_len {
                    let mut pieces: VecDeque<Vec<u8>> =
                        split_response(id, response, self.piece_len).into();
                    let first = pieces.pop_front().unwrap_or_default();
                    session.pieces = pieces;
                    (ResponseKind::Partial, first)
                } else {
                    (codec::response_kind(&response), encoded)
                }
            }
            Outgoing::Piece(bytes) => (ResponseKind::Partial, bytes),
        };
        self.record(TranscriptEvent::Response { id, kind });
        let sealed = session.record.seal(&bytes)?;
        framed.send(TAG_ENCRYPTED, &sealed).await
    }

    fn respond(&self, session: &mut Session, id: u32, request: DeviceRequest) -> Vec<Outgoing> {
        let silent = self.behaviour == Behaviour::Silent;
        match request {
            DeviceRequest::DeviceInfo(_) => {
                vec![Outgoing::Response(DeviceResponse::DeviceInfo(
                    proto::DeviceInfoResponse {
                        name: "bitbox-sim".into(),
                        version: env!("CARGO_PKG_VERSION").into(),
                        initialized: true,
                        unlocked: self.is_unlocked(),
                        supports_antiklepto: true,
                        attestation: self.attestation.clone(),
                    },
                ))]
            }
            DeviceRequest::ContinueResponse(_) => match session.pieces.pop_front() {
                Some(piece) => vec![Outgoing::Piece(piece)],
                None => vec![error(proto::ErrorCode::InvalidInput, "nothing to continue")],
            },
            _ if silent => {
                debug!(call_id = id, "simulator staying silent");
                Vec::new()
            }
            _ if !self.is_unlocked() => vec![error(proto::ErrorCode::Locked, "device locked")],
            DeviceRequest::EthPub(request) => {
                let pubkey = self.public_key(&Keypath::new(request.keypath));
                let address = coins::eth_address(&pubkey).unwrap_or_default();
                vec![Outgoing::Response(DeviceResponse::Pub(proto::PubResponse {
                    pubkey,
                    address,
                }))]
            }
            DeviceRequest::BtcPub(request) => {
                let pubkey = self.public_key(&Keypath::new(request.keypath));
                vec![Outgoing::Response(DeviceResponse::Pub(proto::PubResponse {
                    pubkey,
                    address: String::new(),
                }))]
            }
            DeviceRequest::BtcSign(request) => {
                if let Some(refusal) = self.refuse_signing() {
                    return vec![refusal];
                }
                let Ok(digest) = <[u8; 32]>::try_from(request.sighash.as_slice()) else {
                    return vec![error(proto::ErrorCode::InvalidInput, "sighash must be 32 bytes")];
                };
                let schnorr = proto::BtcScriptType::try_from(request.script_type)
                    .map(|script| BtcScriptType::from(script) == BtcScriptType::P2tr)
                    .unwrap_or(false);
                let pending = PendingSign {
                    secret: self.secret_key(&request.keypath),
                    schnorr,
                    host_commitment: request.host_nonce_commitment,
                };
                self.commit(session, pending, digest)
            }
            DeviceRequest::EthSignTyped(request) => {
                if let Some(refusal) = self.refuse_signing() {
                    return vec![refusal];
                }
                let (Ok(domain), Ok(message)) = (
                    <[u8; 32]>::try_from(request.domain_separator_hash.as_slice()),
                    <[u8; 32]>::try_from(request.message_hash.as_slice()),
                ) else {
                    return vec![error(proto::ErrorCode::InvalidInput, "hashes must be 32 bytes")];
                };
                let digest = coins::eip712_sighash(&bitbox_connect::TypedDataHash {
                    keypath: Keypath::new(request.keypath.clone()),
                    chain_id: request.chain_id,
                    domain_separator_hash: domain,
                    message_hash: message,
                });
                let pending = PendingSign {
                    secret: self.secret_key(&request.keypath),
                    schnorr: false,
                    host_commitment: request.host_nonce_commitment,
                };
                self.commit(session, pending, digest)
            }
            DeviceRequest::EthSign(request) => {
                if let Some(refusal) = self.refuse_signing() {
                    return vec![refusal];
                }
                let pending = PendingSign {
                    secret: self.secret_key(&request.keypath),
                    schnorr: false,
                    host_commitment: request.host_nonce_commitment.clone(),
                };
                let data = request.data_initial_chunk.clone();
                let total = request.data_length as usize;
                if data.len() > total {
                    return vec![error(proto::ErrorCode::InvalidInput, "initial chunk too long")];
                }
                session.signing = SignState::Streaming {
                    pending,
                    request,
                    data,
                    total,
                };
                self.continue_streaming(session)
            }
            DeviceRequest::DataChunk(chunk) => {
                let SignState::Streaming { data, .. } = &mut session.signing else {
                    session.signing = SignState::Idle;
                    return vec![error(proto::ErrorCode::InvalidInput, "no data expected")];
                };
                if chunk.offset as usize != data.len() {
                    session.signing = SignState::Idle;
                    return vec![error(proto::ErrorCode::InvalidInput, "wrong data offset")];
                }
                data.extend_from_slice(&chunk.data);
                self.continue_streaming(session)
            }
            DeviceRequest::AntiKleptoReveal(reveal) => self.reveal(session, &reveal.host_nonce),
        }
    }

    fn refuse_signing(&self) -> Option<Outgoing> {
        match self.behaviour {
            Behaviour::UserAbort => Some(error(proto::ErrorCode::UserAbort, "declined on device")),
            Behaviour::BusyOnce if self.busy_pending.swap(false, Ordering::SeqCst) => {
                Some(error(proto::ErrorCode::Busy, "device busy"))
            }
            _ => None,
        }
    }

    fn continue_streaming(&self, session: &mut Session) -> Vec<Outgoing> {
        let state = std::mem::replace(&mut session.signing, SignState::Idle);
        let SignState::Streaming {
            pending,
            request,
            data,
            total,
        } = state
        else {
            return vec![error(proto::ErrorCode::InvalidInput, "no data expected")];
        };
        if data.len() > total {
            return vec![error(proto::ErrorCode::InvalidInput, "more data than announced")];
        }
        if data.len() < total {
            let request_more = DeviceResponse::DataRequest(proto::DataRequestResponse {
                offset: data.len() as u32,
                length: (total - data.len()).min(proto::ETH_DATA_CHUNK_SIZE) as u32,
            });
            session.signing = SignState::Streaming {
                pending,
                request,
                data,
                total,
            };
            return vec![Outgoing::Response(request_more)];
        }
        let digest = coins::eth_sighash(&eth_transaction(&request, data));
        self.commit(session, pending, digest)
    }

    fn commit(&self, session: &mut Session, pending: PendingSign, digest: [u8; 32]) -> Vec<Outgoing> {
        if pending.host_commitment.len() != 32 {
            return vec![error(proto::ErrorCode::InvalidInput, "missing host nonce commitment")];
        }
        let nonce_secret: [u8; 32] = rand::random();
        let mut out = vec![Outgoing::Response(DeviceResponse::Progress(
            proto::ProgressResponse {
                kind: proto::ProgressKind::ConfirmOnDevice as i32,
            },
        ))];

        if self.behaviour == Behaviour::SignatureBeforeCommitment {
            // Sign with a nonce the host never had a say in.
            let signature = if pending.schnorr {
                antiklepto::signer::sign_schnorr(&pending.secret, &digest, &nonce_secret, &[0; 32])
                    .map(|sig| (sig, 0))
            } else {
                antiklepto::signer::sign_ecdsa(&pending.secret, &digest, &nonce_secret, &[0; 32])
            };
            return match signature {
                Ok((signature, recid)) => {
                    out.push(signature_response(signature, recid));
                    out
                }
                Err(err) => vec![error(proto::ErrorCode::Generic, &err.to_string())],
            };
        }

        let commitment = match antiklepto::signer::commit(&nonce_secret) {
            Ok(commitment) => commitment,
            Err(err) => return vec![error(proto::ErrorCode::Generic, &err.to_string())],
        };
        out.push(Outgoing::Response(DeviceResponse::SignerCommitment(
            proto::SignerCommitmentResponse {
                commitment: commitment.as_bytes().to_vec(),
            },
        )));
        session.signing = SignState::Committed {
            pending,
            digest,
            nonce_secret,
        };
        out
    }

    fn reveal(&self, session: &mut Session, host_nonce: &[u8]) -> Vec<Outgoing> {
        let state = std::mem::replace(&mut session.signing, SignState::Idle);
        let SignState::Committed {
            pending,
            digest,
            nonce_secret,
        } = state
        else {
            return vec![error(proto::ErrorCode::InvalidInput, "no signing in progress")];
        };
        let Ok(mut host_nonce) = <[u8; 32]>::try_from(host_nonce) else {
            return vec![error(proto::ErrorCode::InvalidInput, "host nonce must be 32 bytes")];
        };
        if antiklepto::host_commitment(&host_nonce).as_slice() != pending.host_commitment {
            return vec![error(proto::ErrorCode::InvalidInput, "host nonce does not match commitment")];
        }

        match self.behaviour {
            Behaviour::DuplicateCommitment => {
                let commitment = antiklepto::signer::commit(&nonce_secret)
                    .map(|c| c.as_bytes().to_vec())
                    .unwrap_or_default();
                return vec![Outgoing::Response(DeviceResponse::SignerCommitment(
                    proto::SignerCommitmentResponse { commitment },
                ))];
            }
            Behaviour::TamperHostNonce => host_nonce[31] ^= 0x80,
            _ => {}
        }

        let mut out = vec![Outgoing::Response(DeviceResponse::Progress(
            proto::ProgressResponse {
                kind: proto::ProgressKind::ButtonPressed as i32,
            },
        ))];
        let signature = if pending.schnorr {
            antiklepto::signer::sign_schnorr(&pending.secret, &digest, &nonce_secret, &host_nonce)
                .map(|sig| (sig, 0))
        } else {
            antiklepto::signer::sign_ecdsa(&pending.secret, &digest, &nonce_secret, &host_nonce)
        };
        match signature {
            Ok((signature, recid)) => out.push(signature_response(signature, recid)),
            Err(err) => return vec![error(proto::ErrorCode::Generic, &err.to_string())],
        }
        out
    }
}

enum Outgoing {
    Response(DeviceResponse),
    /// An already encoded piece of a partial response.
    Piece(Vec<u8>),
}

struct PendingSign {
    secret: [u8; 32],
    schnorr: bool,
    host_commitment: Vec<u8>,
}

enum SignState {
    Idle,
    Streaming {
        pending: PendingSign,
        request: proto::EthSignRequest,
        data: Vec<u8>,
        total: usize,
    },
    Committed {
        pending: PendingSign,
        digest: [u8; 32],
        nonce_secret: [u8; 32],
    },
}

struct Session {
    record: RecordLayer,
    handshake_hash: [u8; 32],
    code: PairingCode,
    confirmed: bool,
    pending_config: Option<ChannelConfig>,
    signing: SignState,
    pieces: VecDeque<Vec<u8>>,
}

fn error(code: proto::ErrorCode, message: &str) -> Outgoing {
    Outgoing::Response(DeviceResponse::Error(proto::ErrorResponse {
        code: code as i32,
        message: message.to_string(),
    }))
}

fn signature_response(signature: [u8; 64], recid: u8) -> Outgoing {
    Outgoing::Response(DeviceResponse::Signature(proto::SignatureResponse {
        signature: signature.to_vec(),
        recid: u32::from(recid),
    }))
}

fn eth_transaction(request: &proto::EthSignRequest, data: Vec<u8>) -> EthTransaction {
    let mut recipient = [0u8; 20];
    if request.recipient.len() == 20 {
        recipient.copy_from_slice(&request.recipient);
    }
    let tx_type = proto::EthTxType::try_from(request.tx_type)
        .map(EthTxType::from)
        .unwrap_or(EthTxType::Legacy);
    let keypath = Keypath::new(request.keypath.clone());
    let tx = match tx_type {
        EthTxType::Legacy => {
            EthTransaction::legacy(keypath, request.chain_id).with_gas_price(request.gas_price.clone())
        }
        EthTxType::Eip1559 => EthTransaction::eip1559(keypath, request.chain_id)
            .with_max_priority_fee(request.max_priority_fee.clone())
            .with_max_fee(request.max_fee.clone()),
    };
    tx.with_nonce(request.nonce.clone())
        .with_gas_limit(request.gas_limit.clone())
        .with_recipient(recipient)
        .with_value(request.value.clone())
        .with_data(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_depend_on_keypath() {
        let device = SimulatedDevice::new([7u8; 32]);
        let a: Keypath = "m/84'/0'/0'/0/0".parse().unwrap();
        let b: Keypath = "m/84'/0'/0'/0/1".parse().unwrap();
        assert_eq!(device.public_key(&a).len(), 33);
        assert_ne!(device.public_key(&a), device.public_key(&b));
        assert_eq!(device.public_key(&a), device.clone().public_key(&a));
    }

    #[test]
    fn eth_request_rebuilds_same_transaction() {
        let tx = EthTransaction::eip1559("m/44'/60'/0'/0/0".parse().unwrap(), 5)
            .with_nonce(vec![3])
            .with_max_priority_fee(vec![1])
            .with_max_fee(vec![2])
            .with_gas_limit(vec![0x52, 0x08])
            .with_recipient([9u8; 20])
            .with_value(vec![1, 0])
            .with_data(vec![0xAB; 10]);
        let request = proto::EthSignRequest {
            keypath: tx.keypath.to_vec(),
            chain_id: tx.chain_id,
            tx_type: proto::EthTxType::Eip1559 as i32,
            nonce: tx.nonce.clone(),
            max_priority_fee: tx.max_priority_fee.clone(),
            max_fee: tx.max_fee.clone(),
            gas_limit: tx.gas_limit.clone(),
            recipient: tx.recipient.to_vec(),
            value: tx.value.clone(),
            ..Default::default()
        };
        assert_eq!(eth_transaction(&request, tx.data.clone()), tx);
    }
}
