use thiserror::Error;

const TAG_LEN: usize = 1;
const SEQ_LEN: usize = 2;
const LEN_LEN: usize = 4;
const INIT_HEADER_LEN: usize = TAG_LEN + SEQ_LEN + LEN_LEN;
const CONT_HEADER_LEN: usize = TAG_LEN + SEQ_LEN;
const MAX_FRAMES: usize = u16::MAX as usize + 1;

pub const DEFAULT_FRAME_SIZE: usize = 64;
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Frame geometry shared by both ends of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub frame_size: usize,
    pub max_payload: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameConfig {
    pub fn new(frame_size: usize, max_payload: usize) -> Self {
        Self {
            frame_size,
            max_payload,
        }
    }

    pub fn first_frame_capacity(&self) -> usize {
        self.frame_size.saturating_sub(INIT_HEADER_LEN)
    }

    pub fn continuation_capacity(&self) -> usize {
        self.frame_size.saturating_sub(CONT_HEADER_LEN)
    }

    /// Number of frames needed to carry `len` payload bytes.
    pub fn frame_count(&self, len: usize) -> usize {
        let first = self.first_frame_capacity();
        if len <= first {
            return 1;
        }
        let cont = self.continuation_capacity().max(1);
        1 + (len - first).div_ceil(cont)
    }

    fn validate(&self) -> Result<(), FramingError> {
        if self.frame_size <= INIT_HEADER_LEN {
            return Err(FramingError::FrameSizeTooSmall {
                frame_size: self.frame_size,
            });
        }
        Ok(())
    }
}

/// A fully reassembled payload together with the channel tag it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub tag: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame_size_too_small: {frame_size}")]
    FrameSizeTooSmall { frame_size: usize },
    #[error("frame_size_mismatch: expected {expected}, got {actual}")]
    FrameSize { expected: usize, actual: usize },
    #[error("out_of_order: expected sequence {expected}, got {actual}")]
    OutOfOrder { expected: u16, actual: u16 },
    #[error("length_overflow: declared {declared}, max {max}")]
    LengthOverflow { declared: usize, max: usize },
    #[error("tag_mismatch: expected {expected:#04x}, got {actual:#04x}")]
    TagMismatch { expected: u8, actual: u8 },
}

/// Splits `payload` into fixed-size frames. The last frame is zero padded.
pub fn encode_payload(
    tag: u8,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<Vec<Vec<u8>>, FramingError> {
    config.validate()?;
    if payload.len() > config.max_payload || payload.len() > u32::MAX as usize {
        return Err(FramingError::LengthOverflow {
            declared: payload.len(),
            max: config.max_payload,
        });
    }
    let count = config.frame_count(payload.len());
    if count > MAX_FRAMES {
        return Err(FramingError::LengthOverflow {
            declared: payload.len(),
            max: config.first_frame_capacity()
                + (MAX_FRAMES - 1) * config.continuation_capacity(),
        });
    }

    let mut frames = Vec::with_capacity(count);
    let first_len = payload.len().min(config.first_frame_capacity());
    let mut frame = Vec::with_capacity(config.frame_size);
    frame.push(tag);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload[..first_len]);
    frame.resize(config.frame_size, 0);
    frames.push(frame);

    for (index, chunk) in payload[first_len..]
        .chunks(config.continuation_capacity())
        .enumerate()
    {
        let seq = (index + 1) as u16;
        let mut frame = Vec::with_capacity(config.frame_size);
        frame.push(tag);
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(chunk);
        frame.resize(config.frame_size, 0);
        frames.push(frame);
    }

    Ok(frames)
}

#[derive(Debug)]
struct Partial {
    tag: u8,
    declared: usize,
    next_seq: u16,
    bytes: Vec<u8>,
}

/// Incremental receiver that turns frames back into payloads.
///
/// Any error drops the payload in progress; the next frame must then be an
/// init frame again.
#[derive(Debug)]
pub struct FrameAssembler {
    config: FrameConfig,
    partial: Option<Partial>,
}

impl FrameAssembler {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            partial: None,
        }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }

    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Payload>, FramingError> {
        let result = self.push_inner(frame);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn push_inner(&mut self, frame: &[u8]) -> Result<Option<Payload>, FramingError> {
        self.config.validate()?;
        if frame.len() != self.config.frame_size {
            return Err(FramingError::FrameSize {
                expected: self.config.frame_size,
                actual: frame.len(),
            });
        }

        let tag = frame[0];
        let seq = u16::from_be_bytes([frame[1], frame[2]]);

        let mut partial = match self.partial.take() {
            None => {
                if seq != 0 {
                    return Err(FramingError::OutOfOrder {
                        expected: 0,
                        actual: seq,
                    });
                }
                let declared =
                    u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]) as usize;
                if declared > self.config.max_payload {
                    return Err(FramingError::LengthOverflow {
                        declared,
                        max: self.config.max_payload,
                    });
                }
                let take = declared.min(self.config.first_frame_capacity());
                let mut bytes = Vec::with_capacity(declared);
                bytes.extend_from_slice(&frame[INIT_HEADER_LEN..INIT_HEADER_LEN + take]);
                Partial {
                    tag,
                    declared,
                    next_seq: 1,
                    bytes,
                }
            }
            Some(mut partial) => {
                if seq != partial.next_seq {
                    return Err(FramingError::OutOfOrder {
                        expected: partial.next_seq,
                        actual: seq,
                    });
                }
                if tag != partial.tag {
                    return Err(FramingError::TagMismatch {
                        expected: partial.tag,
                        actual: tag,
                    });
                }
                let remaining = partial.declared - partial.bytes.len();
                let take = remaining.min(self.config.continuation_capacity());
                partial
                    .bytes
                    .extend_from_slice(&frame[CONT_HEADER_LEN..CONT_HEADER_LEN + take]);
                partial.next_seq = partial.next_seq.wrapping_add(1);
                partial
            }
        };

        if partial.bytes.len() == partial.declared {
            return Ok(Some(Payload {
                tag: partial.tag,
                bytes: std::mem::take(&mut partial.bytes),
            }));
        }

        if partial.next_seq == 0 {
            // Sequence space exhausted before the declared length arrived.
            return Err(FramingError::LengthOverflow {
                declared: partial.declared,
                max: partial.bytes.len(),
            });
        }

        self.partial = Some(partial);
        Ok(None)
    }
}
