//! Single-owner actor in front of the secure channel.
//!
//! Every [`DeviceHandle`] clone talks to one actor task over a bounded queue.
//! The actor owns the link, the framing state and the channel keys, and runs
//! exactly one request/response exchange at a time in arrival order.

use std::{sync::Arc, time::Duration};

use bbp_core::{
    Channel, ChannelStore, FramedLink, HandshakeEvent, HandshakeOpts, Link, PairingConfirmer,
};
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{
    self, DeviceRequest, DeviceResponse, PartialAssembler, RequestKind,
    check_response, decode_response, device_error, encode_request, request_kind,
};
use crate::coins;
use crate::config::DeviceConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::proto;
use crate::state::{CommandCategory, DeviceEvent, DeviceState, StateCell};
use crate::types::{BtcCoin, BtcScriptType, DeviceInfo, Keypath, Progress, PublicKeyInfo};

/// Per-call knobs for [`DeviceHandle::invoke_with`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Overrides [`DeviceConfig::call_timeout`].
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Receives progress notifications for this call.
    pub progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl InvokeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, sink: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(sink);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PairingOutcome {
    pub channel_id: [u8; 16],
    pub resumed: bool,
    pub info: DeviceInfo,
}

enum Command {
    Pair {
        confirmer: Arc<dyn PairingConfirmer>,
        cancel: CancellationToken,
        reply: oneshot::Sender<DeviceResult<PairingOutcome>>,
    },
    Invoke {
        request: DeviceRequest,
        timeout: Duration,
        cancel: CancellationToken,
        progress: Option<mpsc::UnboundedSender<Progress>>,
        reply: oneshot::Sender<DeviceResult<DeviceResponse>>,
    },
}

struct HandleInner {
    device_id: String,
    call_timeout: Duration,
    commands: mpsc::Sender<Command>,
    state: Arc<StateCell>,
    shutdown: CancellationToken,
    session: Arc<AsyncMutex<()>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Cheap, cloneable handle to one connected device.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.inner.state.state())
            .finish()
    }
}

impl DeviceHandle {
    /// Spawns the actor for `link`. Must be called within a Tokio runtime.
    pub fn connect<L: Link + 'static>(
        link: L,
        config: DeviceConfig,
        store: Arc<dyn ChannelStore>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(config.queue_depth.max(1));
        let state = Arc::new(StateCell::new(config.event_capacity));
        let shutdown = CancellationToken::new();

        let framed =
            FramedLink::new(link, config.max_payload).with_max_read_retries(config.max_read_retries);
        let actor = Actor {
            channel: Channel::with_framing(framed),
            store,
            state: state.clone(),
            degraded: false,
            awaiting_response: false,
            next_id: 0,
            config: config.clone(),
        };
        info!(device = %config.device_id, "device connected");
        tokio::spawn(actor.run(rx, shutdown.clone()));

        Self {
            inner: Arc::new(HandleInner {
                device_id: config.device_id,
                call_timeout: config.call_timeout,
                commands,
                state,
                shutdown,
                session: Arc::new(AsyncMutex::new(())),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn state(&self) -> DeviceState {
        self.inner.state.state()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeviceEvent> {
        self.inner.state.subscribe()
    }

    /// Tears the connection down. Pending and queued calls fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether both handles drive the same connection.
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.shutdown.is_cancelled() || self.state() == DeviceState::Disconnected
    }

    pub async fn pair(&self, confirmer: Arc<dyn PairingConfirmer>) -> DeviceResult<PairingOutcome> {
        self.pair_with_cancel(confirmer, CancellationToken::new())
            .await
    }

    /// Runs the handshake. Cancelling `cancel` aborts a pending user confirmation.
    pub async fn pair_with_cancel(
        &self,
        confirmer: Arc<dyn PairingConfirmer>,
        cancel: CancellationToken,
    ) -> DeviceResult<PairingOutcome> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Pair {
            confirmer,
            cancel: cancel.clone(),
            reply,
        };
        self.submit(command, rx, &cancel).await
    }

    pub async fn invoke(&self, request: DeviceRequest) -> DeviceResult<DeviceResponse> {
        self.invoke_with(request, InvokeOptions::default()).await
    }

    /// Sends one request and waits for its final response.
    pub async fn invoke_with(
        &self,
        request: DeviceRequest,
        opts: InvokeOptions,
    ) -> DeviceResult<DeviceResponse> {
        let cancel = opts.cancel.clone().unwrap_or_default();
        let _lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            lease = self.inner.session.lock() => lease,
        };
        self.call(request, opts).await
    }

    /// Reserves the device for a multi-step exchange. Other callers queue
    /// until the returned session is dropped.
    pub async fn begin_session(&self) -> DeviceSession {
        let lease = self.inner.session.clone().lock_owned().await;
        DeviceSession {
            handle: self.clone(),
            _lease: lease,
        }
    }

    async fn call(
        &self,
        request: DeviceRequest,
        opts: InvokeOptions,
    ) -> DeviceResult<DeviceResponse> {
        let cancel = opts.cancel.unwrap_or_default();
        let (reply, rx) = oneshot::channel();
        let command = Command::Invoke {
            request,
            timeout: opts.timeout.unwrap_or(self.inner.call_timeout),
            cancel: cancel.clone(),
            progress: opts.progress,
            reply,
        };
        self.submit(command, rx, &cancel).await
    }

    async fn submit<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<DeviceResult<T>>,
        cancel: &CancellationToken,
    ) -> DeviceResult<T> {
        if self.is_disconnected() {
            return Err(DeviceError::Disconnected);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            sent = self.inner.commands.send(command) => {
                if sent.is_err() {
                    return Err(DeviceError::Disconnected);
                }
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeviceError::Cancelled),
            result = rx => result.unwrap_or(Err(DeviceError::Disconnected)),
        }
    }

    pub async fn device_info(&self) -> DeviceResult<DeviceInfo> {
        match self
            .invoke(DeviceRequest::DeviceInfo(proto::DeviceInfoRequest {}))
            .await?
        {
            DeviceResponse::DeviceInfo(info) => Ok(info.into()),
            other => Err(unexpected(RequestKind::DeviceInfo, &other)),
        }
    }

    /// Ethereum public key; the address the device reports must match it.
    pub async fn eth_pub(
        &self,
        keypath: &Keypath,
        chain_id: u64,
        display: bool,
    ) -> DeviceResult<PublicKeyInfo> {
        let request = DeviceRequest::EthPub(proto::EthPubRequest {
            keypath: keypath.to_vec(),
            chain_id,
            display,
        });
        match self.invoke(request).await? {
            DeviceResponse::Pub(pubkey) => {
                let expected = coins::eth_address(&pubkey.pubkey)?;
                if pubkey.address != expected {
                    return Err(DeviceError::protocol(format!(
                        "device address {} does not match public key ({expected})",
                        pubkey.address
                    )));
                }
                Ok(PublicKeyInfo {
                    pubkey: pubkey.pubkey,
                    address: Some(expected),
                })
            }
            other => Err(unexpected(RequestKind::EthPub, &other)),
        }
    }

    pub async fn btc_pub(
        &self,
        keypath: &Keypath,
        coin: BtcCoin,
        script_type: BtcScriptType,
        display: bool,
    ) -> DeviceResult<PublicKeyInfo> {
        let request = DeviceRequest::BtcPub(proto::BtcPubRequest {
            keypath: keypath.to_vec(),
            coin: proto::BtcCoin::from(coin) as i32,
            script_type: proto::BtcScriptType::from(script_type) as i32,
            display,
        });
        match self.invoke(request).await? {
            DeviceResponse::Pub(pubkey) => {
                if pubkey.pubkey.len() != 33 {
                    return Err(DeviceError::protocol("bitcoin public key must be compressed"));
                }
                Ok(PublicKeyInfo {
                    pubkey: pubkey.pubkey,
                    address: (!pubkey.address.is_empty()).then_some(pubkey.address),
                })
            }
            other => Err(unexpected(RequestKind::BtcPub, &other)),
        }
    }
}

fn unexpected(request: RequestKind, response: &DeviceResponse) -> DeviceError {
    DeviceError::protocol(format!(
        "unexpected {:?} response to {request:?}",
        codec::response_kind(response)
    ))
}

/// Exclusive use of the device for one multi-step exchange.
pub struct DeviceSession {
    handle: DeviceHandle,
    _lease: OwnedMutexGuard<()>,
}

impl DeviceSession {
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub async fn invoke(&self, request: DeviceRequest) -> DeviceResult<DeviceResponse> {
        self.handle.call(request, InvokeOptions::default()).await
    }

    pub async fn invoke_with(
        &self,
        request: DeviceRequest,
        opts: InvokeOptions,
    ) -> DeviceResult<DeviceResponse> {
        self.handle.call(request, opts).await
    }
}

struct Actor<L> {
    channel: Channel<L>,
    store: Arc<dyn ChannelStore>,
    state: Arc<StateCell>,
    degraded: bool,
    /// A request is on the wire and its final response has not been read.
    awaiting_response: bool,
    next_id: u32,
    config: DeviceConfig,
}

impl<L: Link + 'static> Actor<L> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if !self.execute(command, &shutdown).await {
                break;
            }
        }

        shutdown.cancel();
        self.channel.invalidate();
        self.state.transition(DeviceState::Disconnected);
        info!(device = %self.config.device_id, "device disconnected");
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Pair { reply, .. } => {
                    let _ = reply.send(Err(DeviceError::Disconnected));
                }
                Command::Invoke { reply, .. } => {
                    let _ = reply.send(Err(DeviceError::Disconnected));
                }
            }
        }
    }

    /// Returns `false` once the connection is gone.
    async fn execute(&mut self, command: Command, shutdown: &CancellationToken) -> bool {
        match command {
            Command::Pair {
                confirmer,
                cancel,
                reply,
            } => {
                if reply.is_closed() || cancel.is_cancelled() {
                    debug!("skipping cancelled pairing request");
                    return true;
                }
                let result = tokio::select! {
                    result = self.pair(confirmer.as_ref(), &cancel) => Some(result),
                    _ = shutdown.cancelled() => None,
                };
                let result = result.unwrap_or(Err(DeviceError::Disconnected));
                let alive = !matches!(result, Err(DeviceError::Disconnected));
                let _ = reply.send(result);
                alive
            }
            Command::Invoke {
                request,
                timeout,
                cancel,
                progress,
                reply,
            } => {
                if reply.is_closed() || cancel.is_cancelled() {
                    debug!(
                        "dropping cancelled {:?} request before sending",
                        request_kind(&request)
                    );
                    return true;
                }
                let result = tokio::select! {
                    result = self.invoke(request, timeout, progress.as_ref()) => Some(result),
                    _ = shutdown.cancelled() => None,
                };
                let result = result.unwrap_or(Err(DeviceError::Disconnected));
                let alive = !matches!(result, Err(DeviceError::Disconnected));
                if reply.send(result).is_err() {
                    debug!("caller went away; response discarded");
                }
                alive
            }
        }
    }

    fn next_call_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.next_id
    }

    async fn pair(
        &mut self,
        confirmer: &dyn PairingConfirmer,
        cancel: &CancellationToken,
    ) -> DeviceResult<PairingOutcome> {
        if self.state.state() == DeviceState::Disconnected {
            return Err(DeviceError::Disconnected);
        }
        self.state.transition(DeviceState::Unpaired);

        let opts = HandshakeOpts {
            device_id: self.config.device_id.clone(),
            handshake_timeout: self.config.handshake_timeout,
            remember: self.config.remember_channel,
            store: self.store.clone(),
        };
        let events = self.state.clone();
        let on_event = move |event: HandshakeEvent| match event {
            HandshakeEvent::PairingCode(code) => {
                info!("pairing code {code}");
                events.publish(DeviceEvent::PairingCode(code));
            }
            HandshakeEvent::Resumed => events.publish(DeviceEvent::ChannelResumed),
            HandshakeEvent::Started | HandshakeEvent::Paired => {}
        };

        let handshake = tokio::select! {
            result = self.channel.handshake(&opts, confirmer, &on_event) => Some(result),
            _ = cancel.cancelled() => None,
        };
        let outcome = match handshake {
            Some(Ok(outcome)) => outcome,
            Some(Err(err)) => return Err(err.into()),
            None => {
                debug!("pairing cancelled");
                self.channel.invalidate();
                return Err(DeviceError::Cancelled);
            }
        };
        self.degraded = false;
        self.awaiting_response = false;

        let id = self.next_call_id();
        let timeout = self.config.call_timeout;
        let request = DeviceRequest::DeviceInfo(proto::DeviceInfoRequest {});
        let info = match time::timeout(timeout, self.exchange(id, request, None)).await {
            Ok(Ok(DeviceResponse::DeviceInfo(info))) => DeviceInfo::from(info),
            Ok(Ok(other)) => {
                self.channel.invalidate();
                return Err(unexpected(RequestKind::DeviceInfo, &other));
            }
            Ok(Err(err)) => {
                self.channel.invalidate();
                return Err(err);
            }
            Err(_) => {
                self.channel.invalidate();
                return Err(DeviceError::Timeout);
            }
        };

        let next = if info.unlocked {
            DeviceState::Unlocked
        } else {
            DeviceState::Locked
        };
        self.state.transition(next);
        Ok(PairingOutcome {
            channel_id: outcome.channel_id,
            resumed: outcome.resumed,
            info,
        })
    }

    async fn invoke(
        &mut self,
        request: DeviceRequest,
        timeout: Duration,
        progress: Option<&mpsc::UnboundedSender<Progress>>,
    ) -> DeviceResult<DeviceResponse> {
        if self.state.state() == DeviceState::Disconnected {
            return Err(DeviceError::Disconnected);
        }
        if self.degraded {
            return Err(DeviceError::ChannelDegraded);
        }
        let category = codec::category(&request);
        self.state.check(category)?;

        let signing = category == CommandCategory::Signing;
        if signing {
            self.state.transition(DeviceState::Busy);
        }

        let id = self.next_call_id();
        let result = match time::timeout(timeout, self.exchange(id, request, progress)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(call_id = id, "call timed out after {timeout:?}");
                Err(DeviceError::Timeout)
            }
        };

        if let Err(err) = &result
            && self.channel.is_paired()
            && (self.awaiting_response || matches!(err, DeviceError::Timeout))
        {
            warn!(call_id = id, "exchange left unfinished ({err}); channel degraded");
            self.degraded = true;
        }

        match &result {
            Err(DeviceError::Disconnected) => {}
            Err(err) if err.is_integrity_failure() || !self.channel.is_paired() => {
                warn!(call_id = id, "channel lost: {err}");
                self.channel.invalidate();
                self.state.transition(DeviceState::Unpaired);
            }
            Err(DeviceError::DeviceLocked) => {
                self.state.transition(DeviceState::Locked);
            }
            _ => {
                if signing && self.state.state() == DeviceState::Busy {
                    self.state.transition(DeviceState::Unlocked);
                }
            }
        }
        result
    }

    async fn exchange(
        &mut self,
        id: u32,
        request: DeviceRequest,
        progress: Option<&mpsc::UnboundedSender<Progress>>,
    ) -> DeviceResult<DeviceResponse> {
        let kind = request_kind(&request);
        debug!(call_id = id, "sending {kind:?}");
        self.channel.send(&encode_request(id, request)).await?;
        self.awaiting_response = true;

        let mut partial: Option<PartialAssembler> = None;
        loop {
            let bytes = self.channel.recv().await?;
            let response = match decode_response(id, &bytes)? {
                DeviceResponse::Progress(update) => {
                    let update = proto::ProgressKind::try_from(update.kind)
                        .map(Progress::from)
                        .map_err(|_| DeviceError::protocol("unknown progress kind"))?;
                    debug!(call_id = id, "progress {update:?}");
                    self.state.publish(DeviceEvent::Progress {
                        call_id: id,
                        progress: update,
                    });
                    if let Some(sink) = progress {
                        let _ = sink.send(update);
                    }
                    continue;
                }
                DeviceResponse::Partial(piece) => {
                    let limit = self.config.max_response_len;
                    let assembler = partial.get_or_insert_with(|| PartialAssembler::new(limit));
                    assembler.push(&piece.data)?;
                    if piece.more {
                        let next = DeviceRequest::ContinueResponse(
                            proto::ContinueResponseRequest {},
                        );
                        self.channel.send(&encode_request(id, next)).await?;
                        continue;
                    }
                    self.awaiting_response = false;
                    match partial.take() {
                        Some(assembler) => assembler.finish(id)?,
                        None => return Err(DeviceError::protocol("empty partial response")),
                    }
                }
                other => {
                    self.awaiting_response = false;
                    other
                }
            };

            if let DeviceResponse::Error(err) = &response {
                let err = device_error(err);
                debug!(call_id = id, "device answered with error: {err}");
                return Err(err);
            }
            check_response(kind, &response)?;
            debug!(call_id = id, "completed {kind:?}");
            return Ok(response);
        }
    }
}

/// Seam the anti-klepto engine drives; implemented by device sessions and test doubles.
#[async_trait::async_trait]
pub trait CommandInvoker: Send + Sync {
    async fn invoke(&self, request: DeviceRequest) -> DeviceResult<DeviceResponse>;
}

#[async_trait::async_trait]
impl CommandInvoker for DeviceSession {
    async fn invoke(&self, request: DeviceRequest) -> DeviceResult<DeviceResponse> {
        DeviceSession::invoke(self, request).await
    }
}

#[async_trait::async_trait]
impl CommandInvoker for DeviceHandle {
    async fn invoke(&self, request: DeviceRequest) -> DeviceResult<DeviceResponse> {
        DeviceHandle::invoke(self, request).await
    }
}

/// Gives the anti-klepto engine exclusive use of the device per signing session.
#[async_trait::async_trait]
pub trait SessionSource: Send + Sync {
    type Session: CommandInvoker;

    async fn begin_session(&self) -> Self::Session;
}

#[async_trait::async_trait]
impl SessionSource for DeviceHandle {
    type Session = DeviceSession;

    async fn begin_session(&self) -> DeviceSession {
        DeviceHandle::begin_session(self).await
    }
}
