mod common;

use std::sync::Arc;

use bbp_core::{ChannelError, ChannelStore, MemoryChannelStore};
use bbp_sim::{Behaviour, FixedConfirmer, TranscriptEvent, connect};
use bitbox_connect::{DeviceError, DeviceErrorKind, DeviceEvent, DeviceState};
use common::{config, device, eth_path, memory_store, paired};

#[tokio::test]
async fn pairing_shows_same_code_on_both_sides() {
    let device = device();
    let handle = connect(&device, config(), memory_store());
    let mut events = handle.subscribe();
    let confirmer = Arc::new(FixedConfirmer::accept());

    let outcome = handle.pair(confirmer.clone()).await.unwrap();
    assert!(!outcome.resumed);
    assert!(outcome.info.unlocked);
    assert_eq!(handle.state(), DeviceState::Unlocked);
    assert_eq!(confirmer.shown(), vec![device.last_pairing_code().unwrap()]);

    let mut saw_code = false;
    let mut saw_unlocked = false;
    while let Ok(event) = events.try_recv() {
        match event {
            DeviceEvent::PairingCode(code) => {
                saw_code = true;
                assert_eq!(Some(code), device.last_pairing_code());
            }
            DeviceEvent::StateChanged {
                to: DeviceState::Unlocked,
                ..
            } => saw_unlocked = true,
            _ => {}
        }
    }
    assert!(saw_code && saw_unlocked);
}

#[tokio::test]
async fn mismatched_code_never_pairs() {
    let device = device().with_behaviour(Behaviour::WrongPairingCode);
    let handle = connect(&device, config(), memory_store());

    let err = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Channel(ChannelError::PairingCodeMismatch)
    ));
    assert_eq!(err.kind(), DeviceErrorKind::Security);
    assert_eq!(handle.state(), DeviceState::Unpaired);
    assert!(matches!(
        handle.device_info().await,
        Err(DeviceError::NotPaired)
    ));
    assert!(!device.transcript().contains(&TranscriptEvent::Paired));
    assert!(!device.remembers_channel());
}

#[tokio::test]
async fn device_declining_pairing_is_reported() {
    let device = device().with_behaviour(Behaviour::RejectPairing);
    let handle = connect(&device, config(), memory_store());
    let err = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Channel(ChannelError::DeviceRejectedPairing)
    ));
    assert_eq!(handle.state(), DeviceState::Unpaired);
}

#[tokio::test]
async fn host_rejection_is_a_user_outcome() {
    let device = device();
    let store = Arc::new(MemoryChannelStore::default());
    let handle = connect(&device, config(), store.clone());
    let err = handle
        .pair(Arc::new(FixedConfirmer::reject()))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Channel(ChannelError::PairingRejected)));
    assert_eq!(err.kind(), DeviceErrorKind::User);
    assert!(store.is_empty());
    assert!(!device.remembers_channel());
}

#[tokio::test]
async fn remembered_channel_resumes_without_code() {
    let device = device();
    let store = Arc::new(MemoryChannelStore::default());

    let first = connect(&device, config(), store.clone());
    first.pair(Arc::new(FixedConfirmer::accept())).await.unwrap();
    assert_eq!(store.len(), 1);
    first.disconnect();

    let second = connect(&device, config(), store.clone());
    let mut events = second.subscribe();
    let confirmer = Arc::new(FixedConfirmer::accept());
    let outcome = second.pair(confirmer.clone()).await.unwrap();
    assert!(outcome.resumed);
    assert!(confirmer.shown().is_empty());
    assert_eq!(second.state(), DeviceState::Unlocked);

    let mut resumed = false;
    while let Ok(event) = events.try_recv() {
        resumed |= matches!(event, DeviceEvent::ChannelResumed);
    }
    assert!(resumed);
    second.device_info().await.unwrap();
}

#[tokio::test]
async fn forgotten_channel_falls_back_to_pairing() {
    let device = device();
    let store = Arc::new(MemoryChannelStore::default());
    let first = connect(&device, config(), store.clone());
    first.pair(Arc::new(FixedConfirmer::accept())).await.unwrap();
    first.disconnect();

    device.forget_channel();
    let second = connect(&device, config(), store.clone());
    let confirmer = Arc::new(FixedConfirmer::accept());
    let outcome = second.pair(confirmer.clone()).await.unwrap();
    assert!(!outcome.resumed);
    assert_eq!(confirmer.shown().len(), 1);
    assert!(store.load("sim-1").await.unwrap().is_some());
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    let device = device();

    let store: Arc<dyn ChannelStore> = Arc::new(bbp_core::FileChannelStore::new(&path));
    let first = connect(&device, config(), store);
    first.pair(Arc::new(FixedConfirmer::accept())).await.unwrap();
    first.disconnect();

    let reopened: Arc<dyn ChannelStore> = Arc::new(bbp_core::FileChannelStore::new(&path));
    let second = connect(&device, config(), reopened);
    let outcome = second
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();
    assert!(outcome.resumed);
}

#[tokio::test]
async fn locked_device_only_answers_queries() {
    let device = device().locked();
    let (handle, outcome) = paired(&device).await;
    assert!(!outcome.info.unlocked);
    assert_eq!(handle.state(), DeviceState::Locked);

    let err = handle.eth_pub(&eth_path(0), 1, false).await.unwrap_err();
    assert!(matches!(err, DeviceError::DeviceLocked));
    assert!(err.is_recoverable());
    let sent_keys = device.transcript().iter().any(|event| {
        matches!(
            event,
            TranscriptEvent::Request {
                kind: bitbox_connect::RequestKind::EthPub,
                ..
            }
        )
    });
    assert!(!sent_keys, "locked gate must not touch the wire");
    handle.device_info().await.unwrap();

    device.unlock();
    let outcome = handle
        .pair(Arc::new(FixedConfirmer::accept()))
        .await
        .unwrap();
    assert!(outcome.resumed);
    assert_eq!(handle.state(), DeviceState::Unlocked);
    handle.eth_pub(&eth_path(0), 1, false).await.unwrap();
}
