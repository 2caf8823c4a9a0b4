//! Handshake and pairing confirmation messages.
//!
//! `HandshakeInit` and `HandshakeReply` travel in [`TAG_HANDSHAKE`] frames.
//! `PairingConfirm` and `PairingAck` are the first sealed records in each
//! direction.
//!
//! [`TAG_HANDSHAKE`]: crate::channel::TAG_HANDSHAKE

use crate::error::ChannelError;

pub const PROTOCOL_VERSION: u8 = 1;

pub const MSG_HANDSHAKE_INIT: u8 = 0x01;
pub const MSG_HANDSHAKE_REPLY: u8 = 0x02;
pub const MSG_PAIRING_CONFIRM: u8 = 0x10;
pub const MSG_PAIRING_ACK: u8 = 0x11;

const FLAG_RESUMED: u8 = 0x01;
const FLAG_SUPPORTS_RESUME: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub channel_id: [u8; 16],
    pub mac: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInit {
    pub version: u8,
    pub host_ephemeral: [u8; 32],
    pub resume: Option<ResumeRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub version: u8,
    pub device_ephemeral: [u8; 32],
    pub channel_id: [u8; 16],
    pub resumed: bool,
    pub supports_resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfirm {
    pub accepted: bool,
    pub digest: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAck {
    pub accepted: bool,
    pub digest: [u8; 32],
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], msg_type: u8) -> Result<Self, ChannelError> {
        match bytes.first() {
            Some(t) if *t == msg_type => Ok(Self { bytes: &bytes[1..] }),
            Some(t) => Err(ChannelError::UnexpectedMessage(*t)),
            None => Err(ChannelError::MalformedHandshake("empty message")),
        }
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ChannelError> {
        let (first, rest) = self
            .bytes
            .split_first()
            .ok_or(ChannelError::MalformedHandshake(what))?;
        self.bytes = rest;
        Ok(*first)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], ChannelError> {
        if self.bytes.len() < N {
            return Err(ChannelError::MalformedHandshake(what));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[..N]);
        self.bytes = &self.bytes[N..];
        Ok(out)
    }

    fn bool(&mut self, what: &'static str) -> Result<bool, ChannelError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ChannelError::MalformedHandshake(what)),
        }
    }

    fn finish(self) -> Result<(), ChannelError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::MalformedHandshake("trailing bytes"))
        }
    }
}

fn check_version(version: u8) -> Result<u8, ChannelError> {
    if version != PROTOCOL_VERSION {
        return Err(ChannelError::UnsupportedVersion(version));
    }
    Ok(version)
}

impl HandshakeInit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + 32 + 48);
        out.push(MSG_HANDSHAKE_INIT);
        out.push(self.version);
        out.extend_from_slice(&self.host_ephemeral);
        match &self.resume {
            Some(resume) => {
                out.push(1);
                out.extend_from_slice(&resume.channel_id);
                out.extend_from_slice(&resume.mac);
            }
            None => out.push(0),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let mut r = Reader::new(bytes, MSG_HANDSHAKE_INIT)?;
        let version = check_version(r.u8("version")?)?;
        let host_ephemeral = r.array("host ephemeral")?;
        let resume = if r.bool("resume flag")? {
            Some(ResumeRequest {
                channel_id: r.array("channel id")?,
                mac: r.array("resume mac")?,
            })
        } else {
            None
        };
        r.finish()?;
        Ok(Self {
            version,
            host_ephemeral,
            resume,
        })
    }
}

impl HandshakeReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.resumed {
            flags |= FLAG_RESUMED;
        }
        if self.supports_resume {
            flags |= FLAG_SUPPORTS_RESUME;
        }
        let mut out = Vec::with_capacity(3 + 32 + 16);
        out.push(MSG_HANDSHAKE_REPLY);
        out.push(self.version);
        out.extend_from_slice(&self.device_ephemeral);
        out.extend_from_slice(&self.channel_id);
        out.push(flags);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let mut r = Reader::new(bytes, MSG_HANDSHAKE_REPLY)?;
        let version = check_version(r.u8("version")?)?;
        let device_ephemeral = r.array("device ephemeral")?;
        let channel_id = r.array("channel id")?;
        let flags = r.u8("flags")?;
        if flags & !(FLAG_RESUMED | FLAG_SUPPORTS_RESUME) != 0 {
            return Err(ChannelError::MalformedHandshake("unknown flags"));
        }
        r.finish()?;
        Ok(Self {
            version,
            device_ephemeral,
            channel_id,
            resumed: flags & FLAG_RESUMED != 0,
            supports_resume: flags & FLAG_SUPPORTS_RESUME != 0,
        })
    }
}

impl PairingConfirm {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        out.push(MSG_PAIRING_CONFIRM);
        out.push(self.accepted as u8);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let mut r = Reader::new(bytes, MSG_PAIRING_CONFIRM)?;
        let accepted = r.bool("accepted")?;
        let digest = r.array("digest")?;
        r.finish()?;
        Ok(Self { accepted, digest })
    }
}

impl PairingAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        out.push(MSG_PAIRING_ACK);
        out.push(self.accepted as u8);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let mut r = Reader::new(bytes, MSG_PAIRING_ACK)?;
        let accepted = r.bool("accepted")?;
        let digest = r.array("digest")?;
        r.finish()?;
        Ok(Self { accepted, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_resume_roundtrips() {
        let init = HandshakeInit {
            version: PROTOCOL_VERSION,
            host_ephemeral: [3u8; 32],
            resume: Some(ResumeRequest {
                channel_id: [4u8; 16],
                mac: [5u8; 32],
            }),
        };
        assert_eq!(HandshakeInit::decode(&init.encode()).unwrap(), init);
    }

    #[test]
    fn reply_flags_roundtrip() {
        let reply = HandshakeReply {
            version: PROTOCOL_VERSION,
            device_ephemeral: [1u8; 32],
            channel_id: [2u8; 16],
            resumed: true,
            supports_resume: true,
        };
        let bytes = reply.encode();
        assert_eq!(*bytes.last().unwrap(), 0x03);
        assert_eq!(HandshakeReply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn rejects_other_versions() {
        let mut bytes = HandshakeInit {
            version: PROTOCOL_VERSION,
            host_ephemeral: [3u8; 32],
            resume: None,
        }
        .encode();
        bytes[1] = 2;
        assert!(matches!(
            HandshakeInit::decode(&bytes),
            Err(ChannelError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn fails_closed_on_unknown_input() {
        assert!(matches!(
            HandshakeReply::decode(&[0x7f, 1]),
            Err(ChannelError::UnexpectedMessage(0x7f))
        ));
        assert!(matches!(
            PairingAck::decode(&[MSG_PAIRING_ACK, 2]),
            Err(ChannelError::MalformedHandshake(_))
        ));
        let mut bytes = PairingConfirm {
            accepted: true,
            digest: [0u8; 32],
        }
        .encode();
        bytes.push(0);
        assert!(matches!(
            PairingConfirm::decode(&bytes),
            Err(ChannelError::MalformedHandshake("trailing bytes"))
        ));
    }
}
