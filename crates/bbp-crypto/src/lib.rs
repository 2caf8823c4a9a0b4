//! Cryptographic primitives for the BitBox pairing protocol.

pub mod antiklepto;
pub mod pairing;
pub mod suite;
pub mod tools;
pub mod traits;

pub use antiklepto::{AntiKleptoError, HostNonce, SignerCommitment};
pub use pairing::{PairingCode, derive_session_secrets, handshake_hash};
pub use suite::X25519AesGcmSuite;
pub use traits::{ChannelKeys, CipherSuite, CryptoError, PersistenceKeys, SessionSecrets};
