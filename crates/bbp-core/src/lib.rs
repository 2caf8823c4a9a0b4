//! Host side of the BitBox pairing protocol: framed link, handshake, record
//! layer and remembered channels.

pub mod channel;
pub mod error;
pub mod framed;
pub mod handshake;
pub mod link;
pub mod session;
pub mod store;

pub use channel::{Direction, RecordLayer, TAG_ENCRYPTED, TAG_HANDSHAKE};
pub use error::ChannelError;
pub use framed::FramedLink;
pub use link::{Link, LinkError};
pub use session::{
    Channel, HandshakeEvent, HandshakeOpts, HandshakeOutcome, PairingConfirmer, PairingState,
};
pub use store::{
    CHANNEL_CONFIG_VERSION, ChannelConfig, ChannelStore, FileChannelStore, MemoryChannelStore,
    StorageError,
};
