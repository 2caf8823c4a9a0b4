use bbp_codec::{FrameAssembler, FrameConfig, Payload, encode_payload};
use tracing::{debug, trace};

use crate::{
    error::ChannelError,
    link::{Link, LinkError},
};

/// A [`Link`] with payload framing on top.
pub struct FramedLink<L> {
    link: L,
    config: FrameConfig,
    assembler: FrameAssembler,
    max_read_retries: Option<u32>,
}

impl<L: Link> FramedLink<L> {
    pub fn new(link: L, max_payload: usize) -> Self {
        let config = FrameConfig::new(link.frame_size(), max_payload);
        Self {
            link,
            config,
            assembler: FrameAssembler::new(config),
            max_read_retries: None,
        }
    }

    /// Caps how many transient read timeouts are absorbed per payload. `None` retries forever.
    pub fn with_max_read_retries(mut self, retries: Option<u32>) -> Self {
        self.max_read_retries = retries;
        self
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    pub fn reset(&mut self) {
        self.assembler.reset();
    }

    pub async fn send(&mut self, tag: u8, payload: &[u8]) -> Result<(), ChannelError> {
        let frames = encode_payload(tag, payload, &self.config)?;
        trace!(tag, len = payload.len(), frames = frames.len(), "sending payload");
        for frame in frames {
            self.link.write(&frame).await?;
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Payload, ChannelError> {
        let mut retries = 0u32;
        loop {
            let frame = match self.link.read().await {
                Ok(frame) => frame,
                Err(LinkError::ReadTimeout) => {
                    retries += 1;
                    if let Some(max) = self.max_read_retries
                        && retries > max
                    {
                        debug!("giving up after {max} transient read timeouts");
                        return Err(ChannelError::Timeout);
                    }
                    continue;
                }
                Err(LinkError::Closed) => return Err(ChannelError::Disconnected),
                Err(err) => return Err(err.into()),
            };
            if let Some(payload) = self.assembler.push(&frame)? {
                trace!(tag = payload.tag, len = payload.bytes.len(), "received payload");
                return Ok(payload);
            }
        }
    }
}
