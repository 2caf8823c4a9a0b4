use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use rand::{CryptoRng, Rng};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::tools::get_iv_from_counter;
use crate::traits::{ChannelKeys, CipherSuite, CryptoError, PersistenceKeys, SessionSecrets};

const OKM_LEN: usize = 32 * 5;

/// X25519 key agreement, HKDF-SHA256 key schedule, AES-256-GCM records.
#[derive(Debug)]
pub struct X25519AesGcmSuite;

impl X25519AesGcmSuite {
    pub fn generate_keypair_with_rng<R: Rng + CryptoRng>(rng: &mut R) -> (StaticSecret, [u8; 32]) {
        let mut secret = [0u8; 32];
        rng.fill(&mut secret);
        let privkey = StaticSecret::from(secret);
        let pubkey = PublicKey::from(&privkey);
        (privkey, pubkey.to_bytes())
    }
}

fn split32(okm: &[u8], index: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&okm[index * 32..(index + 1) * 32]);
    out
}

impl CipherSuite for X25519AesGcmSuite {
    type EphemeralPriv = StaticSecret;

    fn generate_keypair() -> (Self::EphemeralPriv, [u8; 32]) {
        let mut rng = rand::rng();
        Self::generate_keypair_with_rng(&mut rng)
    }

    fn ecdh(privkey: &Self::EphemeralPriv, peer_pub: &[u8]) -> Result<[u8; 32], CryptoError> {
        let arr: [u8; 32] = peer_pub
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let shared = privkey.diffie_hellman(&PublicKey::from(arr));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        Ok(shared.to_bytes())
    }

    fn kdf(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<SessionSecrets, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = [0u8; OKM_LEN];
        hk.expand(info, &mut okm)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;

        Ok(SessionSecrets {
            keys: ChannelKeys {
                host_to_device: split32(&okm, 0),
                device_to_host: split32(&okm, 1),
            },
            pairing_seed: split32(&okm, 2),
            persistence: PersistenceKeys {
                encryption: split32(&okm, 3),
                authentication: split32(&okm, 4),
            },
        })
    }

    fn encrypt(
        key: &[u8; 32],
        counter: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailure)?;
        let nonce = Nonce::from(get_iv_from_counter(counter));
        cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailure)
    }

    fn decrypt(
        key: &[u8; 32],
        counter: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailure)?;
        let nonce = Nonce::from(get_iv_from_counter(counter));
        cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailure)
    }
}
