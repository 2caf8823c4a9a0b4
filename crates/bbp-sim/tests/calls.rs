mod common;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bbp_core::{ChannelError, Link, LinkError};
use bbp_sim::{
    Behaviour, FixedConfirmer, SimLink, SimulatedDevice, TranscriptEvent, default_link_pair,
};
use bitbox_connect::{
    BtcCoin, BtcScriptType, CommitmentPair, DeviceError, DeviceEvent, DeviceHandle, DeviceRegistry,
    DeviceRequest, DeviceResponse, DeviceState, InvokeOptions, Progress, RegistryEvent,
    RequestKind, ResponseKind, proto,
};
use common::{btc_path, config, device, eth_path, memory_store, paired};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn btc_sign_request() -> DeviceRequest {
    DeviceRequest::BtcSign(proto::BtcSignRequest {
        keypath: btc_path().to_vec(),
        coin: proto::BtcCoin::Btc as i32,
        script_type: proto::BtcScriptType::P2wpkh as i32,
        sighash: vec![0x11; 32],
        host_nonce_commitment: CommitmentPair::new().host_commitment().to_vec(),
    })
}

/// Host end that reports a transient timeout whenever no frame arrives within `poll`.
struct PollingLink {
    inner: SimLink,
    poll: Duration,
}

#[async_trait]
impl Link for PollingLink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.inner.write(frame).await
    }

    async fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        tokio::time::timeout(self.poll, self.inner.read())
            .await
            .unwrap_or(Err(LinkError::ReadTimeout))
    }

    fn frame_size(&self) -> usize {
        self.inner.frame_size()
    }
}

fn requests(device: &SimulatedDevice) -> Vec<RequestKind> {
    device
        .transcript()
        .into_iter()
        .filter_map(|event| match event {
            TranscriptEvent::Request { kind, .. } => Some(kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn concurrent_calls_never_interleave() {
    let device = device();
    let (handle, _) = paired(&device).await;

    let mut tasks = Vec::new();
    for index in 0..5 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.eth_pub(&eth_path(index), 1, false).await
        }));
    }
    for (index, task) in tasks.into_iter().enumerate() {
        let info = task.await.unwrap().unwrap();
        assert_eq!(info.pubkey, device.public_key(&eth_path(index as u32)));
    }

    // Each request is answered before the next one reaches the device.
    let traffic: Vec<_> = device
        .transcript()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                TranscriptEvent::Request { .. } | TranscriptEvent::Response { .. }
            )
        })
        .collect();
    assert_eq!(traffic.len() % 2, 0);
    let mut last_id = 0;
    for pair in traffic.chunks(2) {
        let (TranscriptEvent::Request { id: sent, .. }, TranscriptEvent::Response { id: got, .. }) =
            (&pair[0], &pair[1])
        else {
            panic!("interleaved traffic: {traffic:?}");
        };
        assert_eq!(sent, got);
        assert!(*sent > last_id);
        last_id = *sent;
    }
}

#[tokio::test]
async fn timeout_degrades_channel_until_repaired() {
    let device = device().with_behaviour(Behaviour::Silent);
    let (handle, _) = paired(&device).await;

    let opts = InvokeOptions::default().with_timeout(Duration::from_millis(100));
    let err = handle.invoke_with(btc_sign_request(), opts).await.unwrap_err();
    assert!(matches!(err, DeviceError::Timeout));

    let err = handle.device_info().await.unwrap_err();
    assert!(matches!(err, DeviceError::ChannelDegraded));

    let outcome = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();
    assert!(outcome.resumed);
    handle.device_info().await.unwrap();
}

#[tokio::test]
async fn exhausted_read_retries_degrade_channel() {
    let device = device().with_behaviour(Behaviour::Silent);
    let (host, device_end) = default_link_pair();
    device.spawn(device_end);
    let link = PollingLink {
        inner: host,
        poll: Duration::from_millis(50),
    };
    let handle = DeviceHandle::connect(
        link,
        config().with_max_read_retries(Some(2)),
        memory_store(),
    );
    handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();

    let err = handle.eth_pub(&eth_path(0), 1, false).await.unwrap_err();
    assert!(matches!(err, DeviceError::Timeout));
    assert!(matches!(
        handle.device_info().await,
        Err(DeviceError::ChannelDegraded)
    ));
}

#[tokio::test]
async fn unknown_progress_degrades_channel_until_repaired() {
    let device = device().with_behaviour(Behaviour::UnknownProgress);
    let (handle, _) = paired(&device).await;

    let err = handle.eth_pub(&eth_path(0), 1, false).await.unwrap_err();
    assert!(matches!(err, DeviceError::ProtocolViolation(_)));

    // The public key still on the wire must never answer a later call.
    for _ in 0..3 {
        assert!(matches!(
            handle.device_info().await,
            Err(DeviceError::ChannelDegraded)
        ));
    }

    let outcome = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();
    assert!(outcome.resumed);
    assert!(handle.device_info().await.unwrap().unlocked);
    assert_eq!(handle.state(), DeviceState::Unlocked);
}

#[tokio::test]
async fn stray_handshake_frame_unpairs() {
    let device = device().with_behaviour(Behaviour::StrayHandshake);
    let (handle, _) = paired(&device).await;

    let err = handle
        .btc_pub(&btc_path(), BtcCoin::Btc, BtcScriptType::P2wpkh, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Channel(ChannelError::UnexpectedMessage(_))
    ));
    assert_eq!(handle.state(), DeviceState::Unpaired);
    assert!(matches!(
        handle.device_info().await,
        Err(DeviceError::NotPaired)
    ));

    handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();
    handle.device_info().await.unwrap();
}

#[tokio::test]
async fn cancelling_a_sent_call_keeps_responses_in_step() {
    let device = device().with_confirm_delay(Duration::from_millis(200));
    let (handle, _) = paired(&device).await;

    let cancel = CancellationToken::new();
    let (sink, mut updates) = mpsc::unbounded_channel();
    let call = {
        let handle = handle.clone();
        let opts = InvokeOptions::default()
            .with_cancel(cancel.clone())
            .with_progress(sink);
        tokio::spawn(async move { handle.invoke_with(btc_sign_request(), opts).await })
    };
    assert_eq!(updates.recv().await, Some(Progress::ConfirmOnDevice));
    cancel.cancel();
    assert!(matches!(call.await.unwrap(), Err(DeviceError::Cancelled)));

    let info = handle.eth_pub(&eth_path(3), 1, false).await.unwrap();
    assert_eq!(info.pubkey, device.public_key(&eth_path(3)));
    assert_eq!(handle.state(), DeviceState::Unlocked);

    let transcript = device.transcript();
    let sign_id = transcript
        .iter()
        .find_map(|event| match event {
            TranscriptEvent::Request {
                id,
                kind: RequestKind::BtcSign,
            } => Some(*id),
            _ => None,
        })
        .unwrap();
    let answered = transcript
        .iter()
        .position(|event| {
            *event
                == TranscriptEvent::Response {
                    id: sign_id,
                    kind: ResponseKind::SignerCommitment,
                }
        })
        .unwrap();
    let next = transcript
        .iter()
        .position(|event| {
            matches!(
                event,
                TranscriptEvent::Request {
                    kind: RequestKind::EthPub,
                    ..
                }
            )
        })
        .unwrap();
    assert!(answered < next);
}

#[tokio::test]
async fn cancelled_call_is_never_sent() {
    let device = device();
    let (handle, _) = paired(&device).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let opts = InvokeOptions::default().with_cancel(cancel);
    let err = handle.invoke_with(btc_sign_request(), opts).await.unwrap_err();
    assert!(matches!(err, DeviceError::Cancelled));
    assert!(err.is_recoverable());

    let info = handle
        .btc_pub(&btc_path(), BtcCoin::Btc, BtcScriptType::P2wpkh, false)
        .await
        .unwrap();
    assert_eq!(info.pubkey, device.public_key(&btc_path()));
    assert!(!requests(&device).contains(&RequestKind::BtcSign));
}

#[tokio::test]
async fn cancelling_a_queued_call_leaves_channel_usable() {
    let device = device();
    let (handle, _) = paired(&device).await;

    let session = handle.begin_session().await;
    let cancel = CancellationToken::new();
    let waiting = {
        let handle = handle.clone();
        let opts = InvokeOptions::default().with_cancel(cancel.clone());
        tokio::spawn(async move { handle.invoke_with(btc_sign_request(), opts).await })
    };
    tokio::task::yield_now().await;
    cancel.cancel();
    assert!(matches!(
        waiting.await.unwrap(),
        Err(DeviceError::Cancelled)
    ));

    session
        .invoke(DeviceRequest::DeviceInfo(proto::DeviceInfoRequest {}))
        .await
        .unwrap();
    drop(session);
    handle.eth_pub(&eth_path(0), 1, false).await.unwrap();
    assert!(!requests(&device).contains(&RequestKind::BtcSign));
}

#[tokio::test]
async fn progress_reaches_sink_and_subscribers() {
    let device = device();
    let (handle, _) = paired(&device).await;
    let mut events = handle.subscribe();
    let (sink, mut updates) = mpsc::unbounded_channel();

    let response = handle
        .invoke_with(btc_sign_request(), InvokeOptions::default().with_progress(sink))
        .await
        .unwrap();
    assert!(matches!(response, DeviceResponse::SignerCommitment(_)));
    assert_eq!(updates.try_recv().unwrap(), Progress::ConfirmOnDevice);

    let mut saw_busy = false;
    let mut saw_progress = false;
    while let Ok(event) = events.try_recv() {
        match event {
            DeviceEvent::StateChanged {
                to: DeviceState::Busy,
                ..
            } => saw_busy = true,
            DeviceEvent::Progress {
                progress: Progress::ConfirmOnDevice,
                ..
            } => saw_progress = true,
            _ => {}
        }
    }
    assert!(saw_busy && saw_progress);
    assert_eq!(handle.state(), DeviceState::Unlocked);
}

#[tokio::test]
async fn large_responses_are_reassembled() {
    let attestation: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let device = device()
        .with_attestation(attestation.clone())
        .with_piece_len(1000);
    let (handle, outcome) = paired(&device).await;
    assert_eq!(outcome.info.attestation, attestation);
    assert!(requests(&device).contains(&RequestKind::ContinueResponse));

    let info = handle.device_info().await.unwrap();
    assert_eq!(info.attestation, attestation);
}

#[tokio::test]
async fn oversized_response_is_rejected() {
    let device = device()
        .with_attestation(vec![7u8; 5000])
        .with_piece_len(1000);
    let handle = bbp_sim::connect(&device, config().with_max_response_len(2000), memory_store());
    let err = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::ProtocolViolation(_)));
}

#[tokio::test]
async fn busy_device_can_be_retried() {
    let device = device().with_behaviour(Behaviour::BusyOnce);
    let (handle, _) = paired(&device).await;

    let err = handle.invoke(btc_sign_request()).await.unwrap_err();
    assert!(matches!(err, DeviceError::DeviceBusy));
    assert!(err.is_recoverable());
    assert_eq!(handle.state(), DeviceState::Unlocked);

    let response = handle.invoke(btc_sign_request()).await.unwrap();
    assert!(matches!(response, DeviceResponse::SignerCommitment(_)));
}

#[tokio::test]
async fn user_abort_is_reported() {
    let device = device().with_behaviour(Behaviour::UserAbort);
    let (handle, _) = paired(&device).await;
    let err = handle.invoke(btc_sign_request()).await.unwrap_err();
    assert!(matches!(err, DeviceError::UserAborted));
    handle.device_info().await.unwrap();
}

#[tokio::test]
async fn disconnect_fails_later_calls() {
    let device = device();
    let (handle, _) = paired(&device).await;
    let mut events = handle.subscribe();

    handle.disconnect();
    assert!(matches!(
        handle.device_info().await,
        Err(DeviceError::Disconnected)
    ));
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Disconnected) => break,
            Ok(_) => {}
            Err(err) => panic!("event stream ended early: {err}"),
        }
    }
    assert_eq!(handle.state(), DeviceState::Disconnected);
}

#[tokio::test]
async fn dropped_link_surfaces_as_disconnect() {
    let device = device();
    let (host, device_end) = default_link_pair();
    let task = device.spawn(device_end);
    let handle = DeviceHandle::connect(host, config(), memory_store());
    handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();

    task.abort();
    let _ = task.await;
    assert!(matches!(
        handle.device_info().await,
        Err(DeviceError::Disconnected)
    ));
    assert!(handle.is_disconnected());
}

#[tokio::test]
async fn registry_forgets_unplugged_device() {
    let device = device();
    let (host, device_end) = default_link_pair();
    let task = device.spawn(device_end);
    let handle = DeviceHandle::connect(host, config(), memory_store());
    handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();

    let registry = DeviceRegistry::default();
    let mut events = registry.subscribe();
    assert!(registry.register(handle.clone()));
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::DeviceInit("sim-1".into())
    );
    assert_eq!(registry.registered(), vec!["sim-1".to_string()]);

    task.abort();
    let _ = task.await;
    let _ = handle.device_info().await;
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, RegistryEvent::DeviceUninit("sim-1".into()));
    assert!(registry.get("sim-1").is_none());
}
