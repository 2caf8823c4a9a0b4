use std::fmt;

use crate::tools::{ct_eq_32, hash_of_two, hmac_sha256, sha256};
use crate::traits::{CipherSuite, CryptoError, SessionSecrets};

pub const PROTOCOL_NAME: &[u8] = b"BBP1_X25519_HKDF-SHA256_AES256GCM";
pub const PAIRING_CODE_MODULUS: u64 = 1_000_000;

const CONFIRM_LABEL: &[u8] = b"bbp-pairing-confirm";
const RESUME_LABEL: &[u8] = b"bbp-resume";

/// Transcript hash binding both ephemeral keys, the channel id and the resume flag.
pub fn handshake_hash(
    host_ephemeral: &[u8; 32],
    device_ephemeral: &[u8; 32],
    channel_id: &[u8; 16],
    resumed: bool,
) -> [u8; 32] {
    let mut h = sha256(PROTOCOL_NAME);
    h = hash_of_two(&h, host_ephemeral);
    h = hash_of_two(&h, device_ephemeral);
    h = hash_of_two(&h, channel_id);
    hash_of_two(&h, &[resumed as u8])
}

/// Runs the key schedule. `resume_secret` is the remembered persistence
/// encryption key when an existing channel is being resumed.
pub fn derive_session_secrets<S: CipherSuite>(
    shared: &[u8; 32],
    channel_id: &[u8; 16],
    handshake_hash: &[u8; 32],
    resume_secret: Option<&[u8; 32]>,
) -> Result<SessionSecrets, CryptoError> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(shared);
    if let Some(secret) = resume_secret {
        ikm.extend_from_slice(secret);
    }
    S::kdf(&ikm, channel_id, handshake_hash)
}

/// Six digit code shown to the user on both sides of a fresh pairing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingCode(u32);

impl PairingCode {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut head = [0u8; 8];
        head.copy_from_slice(&seed[..8]);
        Self((u64::from_be_bytes(head) % PAIRING_CODE_MODULUS) as u32)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Digest exchanged over the encrypted channel to confirm both sides saw
    /// the same code.
    pub fn confirmation_digest(&self, handshake_hash: &[u8; 32]) -> [u8; 32] {
        let mut data = Vec::with_capacity(CONFIRM_LABEL.len() + 32 + 6);
        data.extend_from_slice(CONFIRM_LABEL);
        data.extend_from_slice(handshake_hash);
        data.extend_from_slice(self.to_string().as_bytes());
        sha256(&data)
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl fmt::Debug for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingCode({self})")
    }
}

pub fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq_32(a, b)
}

/// Proof that the host still holds the authentication key of a remembered channel.
pub fn resume_mac(
    authentication_key: &[u8; 32],
    host_ephemeral: &[u8; 32],
    channel_id: &[u8; 16],
) -> [u8; 32] {
    hmac_sha256(authentication_key, &[RESUME_LABEL, host_ephemeral, channel_id])
}

pub fn verify_resume_mac(
    authentication_key: &[u8; 32],
    host_ephemeral: &[u8; 32],
    channel_id: &[u8; 16],
    mac: &[u8; 32],
) -> bool {
    ct_eq_32(&resume_mac(authentication_key, host_ephemeral, channel_id), mac)
}
