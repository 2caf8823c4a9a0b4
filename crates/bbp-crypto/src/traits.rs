use std::fmt;

use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid_key_material")]
    InvalidKeyMaterial,
    #[error("encryption_failure")]
    EncryptionFailure,
    #[error("decryption_failure")]
    DecryptionFailure,
}

/// Directional AEAD keys for an established channel.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKeys {
    pub host_to_device: [u8; 32],
    pub device_to_host: [u8; 32],
}

/// Keys that survive the connection when the channel is remembered.
#[derive(Clone, PartialEq, Eq)]
pub struct PersistenceKeys {
    pub encryption: [u8; 32],
    pub authentication: [u8; 32],
}

/// Everything the key schedule produces for one handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecrets {
    pub keys: ChannelKeys,
    pub pairing_seed: [u8; 32],
    pub persistence: PersistenceKeys,
}

impl ChannelKeys {
    pub fn is_zero(&self) -> bool {
        self.host_to_device.ct_eq(&[0u8; 32]).into() && self.device_to_host.ct_eq(&[0u8; 32]).into()
    }
}

impl fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKeys").finish_non_exhaustive()
    }
}

impl fmt::Debug for PersistenceKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceKeys").finish_non_exhaustive()
    }
}

impl fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecrets").finish_non_exhaustive()
    }
}

/// Key agreement, key schedule and record encryption used by the channel.
pub trait CipherSuite {
    type EphemeralPriv;

    fn generate_keypair() -> (Self::EphemeralPriv, [u8; 32]);
    fn ecdh(privkey: &Self::EphemeralPriv, peer_pub: &[u8]) -> Result<[u8; 32], CryptoError>;
    fn kdf(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<SessionSecrets, CryptoError>;
    fn encrypt(
        key: &[u8; 32],
        counter: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(
        key: &[u8; 32],
        counter: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}
