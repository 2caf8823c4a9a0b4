mod common;

use bbp_crypto::AntiKleptoError;
use bbp_sim::{Behaviour, SimulatedDevice, TranscriptEvent};
use bitbox_connect::{
    AntiKleptoSigner, BtcCoin, BtcScriptType, BtcSignInput, DeviceError, DeviceHandle,
    DeviceState, EthTransaction, RequestKind, SignatureScheme, SigningPayload, SigningSession,
    TypedDataHash,
};
use common::{btc_path, device, eth_path, paired};

fn eth_transfer(data_len: usize) -> EthTransaction {
    EthTransaction::eip1559(eth_path(0), 1)
        .with_nonce(vec![0x07])
        .with_max_priority_fee(vec![0x3b, 0x9a, 0xca, 0x00])
        .with_max_fee(vec![0x04, 0xa8, 0x17, 0xc8, 0x00])
        .with_gas_limit(vec![0x01, 0x86, 0xa0])
        .with_recipient([0x42; 20])
        .with_value(vec![0x0d, 0xe0, 0xb6, 0xb3, 0xa7, 0x64, 0x00, 0x00])
        .with_data((0..data_len).map(|i| i as u8).collect())
}

fn eth_session(device: &SimulatedDevice, data_len: usize) -> SigningSession {
    SigningSession {
        payload: SigningPayload::EthTransaction(eth_transfer(data_len)),
        expected_pubkey: device.public_key(&eth_path(0)),
    }
}

fn btc_session(device: &SimulatedDevice, script_type: BtcScriptType) -> SigningSession {
    SigningSession {
        payload: SigningPayload::Btc(BtcSignInput {
            keypath: btc_path(),
            coin: BtcCoin::Btc,
            script_type,
            sighash: [0xc4; 32],
        }),
        expected_pubkey: device.public_key(&btc_path()),
    }
}

fn signer(handle: &DeviceHandle) -> AntiKleptoSigner<DeviceHandle> {
    AntiKleptoSigner::new(handle.clone())
}

fn sent(device: &SimulatedDevice, kind: RequestKind) -> usize {
    device
        .transcript()
        .iter()
        .filter(|event| matches!(event, TranscriptEvent::Request { kind: k, .. } if *k == kind))
        .count()
}

#[tokio::test]
async fn signs_eth_transaction_with_streamed_data() {
    let device = device();
    let (handle, _) = paired(&device).await;
    let session = eth_session(&device, 3000);

    let signed = signer(&handle).sign(&session).await.unwrap();
    assert_eq!(signed.scheme, SignatureScheme::Ecdsa);
    assert!(matches!(signed.recid, Some(0 | 1)));
    assert_eq!(signed.digest, session.payload.digest());
    assert!(sent(&device, RequestKind::DataChunk) >= 1);
    assert_eq!(sent(&device, RequestKind::AntiKleptoReveal), 1);
    assert_eq!(handle.state(), DeviceState::Unlocked);
}

#[tokio::test]
async fn signs_typed_data() {
    let device = device();
    let (handle, _) = paired(&device).await;
    let session = SigningSession {
        payload: SigningPayload::EthTypedData(TypedDataHash {
            keypath: eth_path(0),
            chain_id: 1,
            domain_separator_hash: [0x01; 32],
            message_hash: [0x02; 32],
        }),
        expected_pubkey: device.public_key(&eth_path(0)),
    };
    let signed = signer(&handle).sign(&session).await.unwrap();
    assert!(signed.recid.is_some());
    assert_eq!(sent(&device, RequestKind::DataChunk), 0);
}

#[tokio::test]
async fn signs_bitcoin_segwit_and_taproot() {
    let device = device();
    let (handle, _) = paired(&device).await;

    let signed = signer(&handle)
        .sign(&btc_session(&device, BtcScriptType::P2wpkh))
        .await
        .unwrap();
    assert_eq!(signed.scheme, SignatureScheme::Ecdsa);
    assert_eq!(signed.recid, None);

    let signed = signer(&handle)
        .sign(&btc_session(&device, BtcScriptType::P2tr))
        .await
        .unwrap();
    assert_eq!(signed.scheme, SignatureScheme::Schnorr);
}

#[tokio::test]
async fn fresh_host_nonce_every_session() {
    let device = device();
    let (handle, _) = paired(&device).await;
    let session = eth_session(&device, 16);
    let first = signer(&handle).sign(&session).await.unwrap();
    let second = signer(&handle).sign(&session).await.unwrap();
    assert_eq!(first.digest, second.digest);
    assert_ne!(first.signature, second.signature);
}

#[tokio::test]
async fn signature_before_commitment_is_refused() {
    let device = device().with_behaviour(Behaviour::SignatureBeforeCommitment);
    let (handle, _) = paired(&device).await;
    let err = signer(&handle)
        .sign(&btc_session(&device, BtcScriptType::P2wpkh))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::CommitmentOrderViolation(_)));
    assert_eq!(sent(&device, RequestKind::AntiKleptoReveal), 0);
}

#[tokio::test]
async fn second_commitment_is_refused() {
    let device = device().with_behaviour(Behaviour::DuplicateCommitment);
    let (handle, _) = paired(&device).await;
    let err = signer(&handle)
        .sign(&eth_session(&device, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::CommitmentOrderViolation(_)));
}

#[tokio::test]
async fn tampered_nonce_fails_verification() {
    let device = device().with_behaviour(Behaviour::TamperHostNonce);
    let (handle, _) = paired(&device).await;

    for session in [
        btc_session(&device, BtcScriptType::P2wpkh),
        btc_session(&device, BtcScriptType::P2tr),
        eth_session(&device, 0),
    ] {
        let err = signer(&handle).sign(&session).await.unwrap_err();
        assert!(
            matches!(
                err,
                DeviceError::SignatureVerificationFailed(AntiKleptoError::NonceMismatch)
            ),
            "unexpected {err:?}"
        );
    }
    // Verification failures leave the channel usable.
    handle.device_info().await.unwrap();
}

#[tokio::test]
async fn wrong_expected_key_fails_verification() {
    let device = device();
    let (handle, _) = paired(&device).await;
    let mut session = btc_session(&device, BtcScriptType::P2wpkh);
    session.expected_pubkey = device.public_key(&eth_path(3));
    let err = signer(&handle).sign(&session).await.unwrap_err();
    assert!(matches!(err, DeviceError::SignatureVerificationFailed(_)));
}

#[tokio::test]
async fn locked_device_fails_fast() {
    let device = device().locked();
    let (handle, _) = paired(&device).await;
    let err = signer(&handle)
        .sign(&btc_session(&device, BtcScriptType::P2wpkh))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::DeviceLocked));
    assert_eq!(sent(&device, RequestKind::BtcSign), 0);
}

#[tokio::test]
async fn concurrent_sessions_are_serialized() {
    let device = device();
    let (handle, _) = paired(&device).await;

    let a = {
        let handle = handle.clone();
        let session = eth_session(&device, 2500);
        tokio::spawn(async move { signer(&handle).sign(&session).await })
    };
    let b = {
        let handle = handle.clone();
        let session = btc_session(&device, BtcScriptType::P2tr);
        tokio::spawn(async move { signer(&handle).sign(&session).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(sent(&device, RequestKind::AntiKleptoReveal), 2);
}
