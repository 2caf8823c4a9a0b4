//! Fixed-size transport framing for the BitBox pairing protocol.

pub mod frame;

pub use frame::{
    DEFAULT_FRAME_SIZE, DEFAULT_MAX_PAYLOAD, FrameAssembler, FrameConfig, FramingError, Payload,
    encode_payload,
};
