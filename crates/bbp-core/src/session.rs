use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bbp_codec::DEFAULT_MAX_PAYLOAD;
use bbp_crypto::{
    CipherSuite, PairingCode, X25519AesGcmSuite, derive_session_secrets, handshake_hash,
    pairing::{digests_match, resume_mac},
};
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    channel::{RecordLayer, TAG_ENCRYPTED, TAG_HANDSHAKE},
    error::ChannelError,
    framed::FramedLink,
    handshake::{
        HandshakeInit, HandshakeReply, PROTOCOL_VERSION, PairingAck, PairingConfirm,
        ResumeRequest,
    },
    link::Link,
    store::{CHANNEL_CONFIG_VERSION, ChannelConfig, ChannelStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    Handshaking,
    AwaitingConfirmation,
    Paired,
}

#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    Started,
    /// Show this code to the user; it must match the one on the device.
    PairingCode(PairingCode),
    Resumed,
    Paired,
}

/// Decides whether the code shown on the device matches the host's. May wait
/// on the user for as long as it likes.
#[async_trait]
pub trait PairingConfirmer: Send + Sync {
    async fn confirm_pairing_code(&self, code: &PairingCode) -> anyhow::Result<bool>;
}

pub struct HandshakeOpts {
    pub device_id: String,
    pub handshake_timeout: Duration,
    pub remember: bool,
    pub store: Arc<dyn ChannelStore>,
}

#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub channel_id: [u8; 16],
    pub resumed: bool,
    pub pairing_code: Option<PairingCode>,
}

/// Host end of one physical connection: framing, pairing state and record layer.
pub struct Channel<L> {
    framed: FramedLink<L>,
    state: PairingState,
    record: Option<RecordLayer>,
}

impl<L: Link> Channel<L> {
    pub fn new(link: L) -> Self {
        Self::with_framing(FramedLink::new(link, DEFAULT_MAX_PAYLOAD))
    }

    pub fn with_framing(framed: FramedLink<L>) -> Self {
        Self {
            framed,
            state: PairingState::Unpaired,
            record: None,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn is_paired(&self) -> bool {
        self.state == PairingState::Paired
    }

    pub fn channel_id(&self) -> Option<[u8; 16]> {
        self.record.as_ref().map(|record| *record.channel_id())
    }

    pub fn link_mut(&mut self) -> &mut L {
        self.framed.link_mut()
    }

    /// Drops keys and partial frames; the next use needs a new handshake.
    pub fn invalidate(&mut self) {
        if self.state != PairingState::Unpaired {
            debug!("channel invalidated in state {:?}", self.state);
        }
        self.state = PairingState::Unpaired;
        self.record = None;
        self.framed.reset();
    }

    pub async fn handshake(
        &mut self,
        opts: &HandshakeOpts,
        confirmer: &dyn PairingConfirmer,
        on_event: &(dyn Fn(HandshakeEvent) + Send + Sync),
    ) -> Result<HandshakeOutcome, ChannelError> {
        self.invalidate();
        self.state = PairingState::Handshaking;
        on_event(HandshakeEvent::Started);
        match self.run_handshake(opts, confirmer, on_event).await {
            Ok(outcome) => {
                self.state = PairingState::Paired;
                on_event(HandshakeEvent::Paired);
                info!(
                    device = %opts.device_id,
                    resumed = outcome.resumed,
                    "secure channel established"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(device = %opts.device_id, "handshake failed: {err}");
                self.invalidate();
                Err(err)
            }
        }
    }

    async fn run_handshake(
        &mut self,
        opts: &HandshakeOpts,
        confirmer: &dyn PairingConfirmer,
        on_event: &(dyn Fn(HandshakeEvent) + Send + Sync),
    ) -> Result<HandshakeOutcome, ChannelError> {
        let remembered = match opts.store.load(&opts.device_id).await {
            Ok(Some(config)) if config.version == CHANNEL_CONFIG_VERSION => Some(config),
            Ok(_) => None,
            Err(err) => {
                warn!("could not load remembered channel: {err}");
                None
            }
        };

        let (host_priv, host_pub) = X25519AesGcmSuite::generate_keypair();
        let resume = remembered.as_ref().map(|config| ResumeRequest {
            channel_id: config.channel,
            mac: resume_mac(&config.authentication, &host_pub, &config.channel),
        });
        let init = HandshakeInit {
            version: PROTOCOL_VERSION,
            host_ephemeral: host_pub,
            resume,
        };
        debug!(resume = init.resume.is_some(), "sending handshake init");
        self.framed.send(TAG_HANDSHAKE, &init.encode()).await?;

        let reply = self.read_handshake_reply(opts.handshake_timeout).await?;
        debug!(
            resumed = reply.resumed,
            supports_resume = reply.supports_resume,
            "received handshake reply"
        );

        let resume_secret = match (&remembered, reply.resumed) {
            (Some(config), true) => {
                if config.channel != reply.channel_id {
                    return Err(ChannelError::MalformedHandshake("resumed unknown channel"));
                }
                Some(config.encryption)
            }
            (None, true) => {
                return Err(ChannelError::MalformedHandshake("resume was not requested"));
            }
            (Some(_), false) => {
                info!("device did not resume the remembered channel, pairing again");
                if let Err(err) = opts.store.forget(&opts.device_id).await {
                    warn!("could not forget stale channel: {err}");
                }
                None
            }
            (None, false) => None,
        };

        let shared = X25519AesGcmSuite::ecdh(&host_priv, &reply.device_ephemeral)?;
        let hh = handshake_hash(
            &host_pub,
            &reply.device_ephemeral,
            &reply.channel_id,
            reply.resumed,
        );
        let secrets = derive_session_secrets::<X25519AesGcmSuite>(
            &shared,
            &reply.channel_id,
            &hh,
            resume_secret.as_ref(),
        )?;
        let code = PairingCode::from_seed(&secrets.pairing_seed);
        self.record = Some(RecordLayer::host(secrets.keys.clone(), reply.channel_id));
        self.state = PairingState::AwaitingConfirmation;

        if reply.resumed {
            on_event(HandshakeEvent::Resumed);
        } else {
            on_event(HandshakeEvent::PairingCode(code));
            let accepted = confirmer
                .confirm_pairing_code(&code)
                .await
                .map_err(ChannelError::PairingHook)?;
            if !accepted {
                let reject = PairingConfirm {
                    accepted: false,
                    digest: [0u8; 32],
                };
                if let Err(err) = self.send_record(&reject.encode()).await {
                    debug!("could not notify device of rejection: {err}");
                }
                return Err(ChannelError::PairingRejected);
            }
        }

        let digest = code.confirmation_digest(&hh);
        let confirm = PairingConfirm {
            accepted: true,
            digest,
        };
        self.send_record(&confirm.encode()).await?;

        let ack_bytes = time::timeout(opts.handshake_timeout, self.recv_record())
            .await
            .map_err(|_| ChannelError::Timeout)??;
        let ack = PairingAck::decode(&ack_bytes)?;
        if !digests_match(&ack.digest, &digest) {
            return Err(ChannelError::PairingCodeMismatch);
        }
        if !ack.accepted {
            return Err(ChannelError::DeviceRejectedPairing);
        }

        if !reply.resumed && opts.remember && reply.supports_resume {
            let config = ChannelConfig::new(reply.channel_id, &secrets.persistence);
            if let Err(err) = opts.store.save(&opts.device_id, config).await {
                return Err(ChannelError::Store(err));
            }
            debug!("remembered channel for {}", opts.device_id);
        }

        Ok(HandshakeOutcome {
            channel_id: reply.channel_id,
            resumed: reply.resumed,
            pairing_code: (!reply.resumed).then_some(code),
        })
    }

    async fn read_handshake_reply(
        &mut self,
        timeout: Duration,
    ) -> Result<HandshakeReply, ChannelError> {
        time::timeout(timeout, async {
            loop {
                let payload = self.framed.recv().await?;
                if payload.tag != TAG_HANDSHAKE {
                    debug!("skipping stale payload with tag {:#04x}", payload.tag);
                    continue;
                }
                return HandshakeReply::decode(&payload.bytes);
            }
        })
        .await
        .map_err(|_| ChannelError::Timeout)?
    }

    async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        let record = self.record.as_mut().ok_or(ChannelError::NotPaired)?;
        let envelope = record.seal(plaintext)?;
        self.framed.send(TAG_ENCRYPTED, &envelope).await
    }

    async fn recv_record(&mut self) -> Result<Vec<u8>, ChannelError> {
        let payload = self.framed.recv().await?;
        let record = self.record.as_mut().ok_or(ChannelError::NotPaired)?;
        if payload.tag != TAG_ENCRYPTED {
            record.invalidate();
            return Err(ChannelError::UnexpectedMessage(payload.tag));
        }
        record.open(&payload.bytes)
    }

    /// Seals and sends one application payload. Requires a paired channel.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        if self.state != PairingState::Paired {
            return Err(ChannelError::NotPaired);
        }
        let result = self.send_record(plaintext).await;
        self.settle(result)
    }

    /// Receives and opens one application payload. Requires a paired channel.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        if self.state != PairingState::Paired {
            return Err(ChannelError::NotPaired);
        }
        let result = self.recv_record().await;
        self.settle(result)
    }

    fn settle<T>(&mut self, result: Result<T, ChannelError>) -> Result<T, ChannelError> {
        if let Err(err) = &result
            && (err.is_integrity_failure()
                || err.is_disconnect()
                || matches!(err, ChannelError::UnexpectedMessage(_)))
        {
            self.invalidate();
        }
        result
    }
}
