use std::marker::PhantomData;

use bbp_crypto::{ChannelKeys, CipherSuite, X25519AesGcmSuite};
use tracing::warn;

use crate::error::ChannelError;

/// Frame tag for plaintext handshake messages.
pub const TAG_HANDSHAKE: u8 = 0x01;
/// Frame tag for sealed records.
pub const TAG_ENCRYPTED: u8 = 0x02;

const COUNTER_LEN: usize = 8;
const AEAD_TAG_LEN: usize = 16;

/// Which end of the channel this record layer seals for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl Direction {
    fn byte(self) -> u8 {
        match self {
            Self::HostToDevice => 0x00,
            Self::DeviceToHost => 0x01,
        }
    }

    fn reverse(self) -> Self {
        match self {
            Self::HostToDevice => Self::DeviceToHost,
            Self::DeviceToHost => Self::HostToDevice,
        }
    }
}

/// Counter-based AEAD envelopes: `counter:u64 BE || ciphertext || tag`.
///
/// Counters start at zero in each direction and must advance by exactly one.
/// Any replayed, skipped or forged record invalidates the layer for good.
pub struct RecordLayer<S = X25519AesGcmSuite> {
    keys: ChannelKeys,
    channel_id: [u8; 16],
    outgoing: Direction,
    send_counter: u64,
    recv_counter: u64,
    invalidated: bool,
    _suite: PhantomData<S>,
}

impl<S: CipherSuite> RecordLayer<S> {
    pub fn new(keys: ChannelKeys, channel_id: [u8; 16], outgoing: Direction) -> Self {
        Self {
            keys,
            channel_id,
            outgoing,
            send_counter: 0,
            recv_counter: 0,
            invalidated: false,
            _suite: PhantomData,
        }
    }

    pub fn host(keys: ChannelKeys, channel_id: [u8; 16]) -> Self {
        Self::new(keys, channel_id, Direction::HostToDevice)
    }

    pub fn device(keys: ChannelKeys, channel_id: [u8; 16]) -> Self {
        Self::new(keys, channel_id, Direction::DeviceToHost)
    }

    pub fn channel_id(&self) -> &[u8; 16] {
        &self.channel_id
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    pub fn recv_counter(&self) -> u64 {
        self.recv_counter
    }

    fn key_for(&self, direction: Direction) -> &[u8; 32] {
        match direction {
            Direction::HostToDevice => &self.keys.host_to_device,
            Direction::DeviceToHost => &self.keys.device_to_host,
        }
    }

    fn aad(&self, direction: Direction, counter: u64) -> [u8; 25] {
        let mut aad = [0u8; 25];
        aad[..16].copy_from_slice(&self.channel_id);
        aad[16] = direction.byte();
        aad[17..].copy_from_slice(&counter.to_be_bytes());
        aad
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if self.invalidated {
            return Err(ChannelError::Invalidated);
        }
        let counter = self.send_counter;
        let next = counter.checked_add(1).ok_or(ChannelError::Invalidated)?;
        let aad = self.aad(self.outgoing, counter);
        let ciphertext = S::encrypt(self.key_for(self.outgoing), counter, &aad, plaintext)?;

        let mut envelope = Vec::with_capacity(COUNTER_LEN + ciphertext.len());
        envelope.extend_from_slice(&counter.to_be_bytes());
        envelope.extend_from_slice(&ciphertext);
        self.send_counter = next;
        Ok(envelope)
    }

    pub fn open(&mut self, envelope: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if self.invalidated {
            return Err(ChannelError::Invalidated);
        }
        let result = self.open_inner(envelope);
        if let Err(err) = &result {
            warn!("record rejected, invalidating channel: {err}");
            self.invalidated = true;
        }
        result
    }

    fn open_inner(&mut self, envelope: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if envelope.len() < COUNTER_LEN + AEAD_TAG_LEN {
            return Err(ChannelError::AuthenticationFailed);
        }
        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&envelope[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter != self.recv_counter {
            return Err(ChannelError::ReplayOrDesync {
                expected: self.recv_counter,
                actual: counter,
            });
        }

        let incoming = self.outgoing.reverse();
        let aad = self.aad(incoming, counter);
        let plaintext = S::decrypt(
            self.key_for(incoming),
            counter,
            &aad,
            &envelope[COUNTER_LEN..],
        )
        .map_err(|_| ChannelError::AuthenticationFailed)?;
        self.recv_counter = counter.wrapping_add(1);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RecordLayer, RecordLayer) {
        let keys = ChannelKeys {
            host_to_device: [1u8; 32],
            device_to_host: [2u8; 32],
        };
        (
            RecordLayer::host(keys.clone(), [7u8; 16]),
            RecordLayer::device(keys, [7u8; 16]),
        )
    }

    #[test]
    fn roundtrip_both_directions() {
        let (mut host, mut device) = pair();
        for i in 0..3u8 {
            let sealed = host.seal(&[i; 10]).unwrap();
            assert_eq!(device.open(&sealed).unwrap(), vec![i; 10]);
            let sealed = device.seal(&[i; 3]).unwrap();
            assert_eq!(host.open(&sealed).unwrap(), vec![i; 3]);
        }
        assert_eq!(host.send_counter(), 3);
        assert_eq!(host.recv_counter(), 3);
    }

    #[test]
    fn replayed_record_is_rejected_and_invalidates() {
        let (mut host, mut device) = pair();
        let first = host.seal(b"one").unwrap();
        device.open(&first).unwrap();
        let err = device.open(&first).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::ReplayOrDesync {
                expected: 1,
                actual: 0
            }
        ));
        assert!(device.is_invalidated());
        let next = host.seal(b"two").unwrap();
        assert!(matches!(device.open(&next), Err(ChannelError::Invalidated)));
    }

    #[test]
    fn skipped_counter_is_rejected() {
        let (mut host, mut device) = pair();
        let _lost = host.seal(b"one").unwrap();
        let second = host.seal(b"two").unwrap();
        assert!(matches!(
            device.open(&second),
            Err(ChannelError::ReplayOrDesync {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let (mut host, mut device) = pair();
        let mut sealed = host.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            device.open(&sealed),
            Err(ChannelError::AuthenticationFailed)
        ));
    }

    #[test]
    fn reflected_record_fails_authentication() {
        let (mut host, _) = pair();
        let sealed = host.seal(b"echo").unwrap();
        assert!(matches!(
            host.open(&sealed),
            Err(ChannelError::AuthenticationFailed)
        ));
    }
}
