//! Sign-to-contract nonce commitments over secp256k1.
//!
//! The host commits to a random nonce contribution, the device commits to its
//! own nonce point `R1`, and only then does the host reveal its contribution.
//! The final signature nonce is `R = R1 + t·G` with
//! `t = tagged_hash("s2c/ecdsa/point", R1 || host_nonce)`, so the device cannot
//! steer `R` to leak key material.

use std::fmt;

use k256::{
    AffinePoint, FieldBytes, ProjectivePoint, PublicKey, Scalar, U256,
    ecdsa::{RecoveryId, Signature, VerifyingKey, signature::hazmat::PrehashVerifier},
    elliptic_curve::{
        PrimeField,
        ops::Reduce,
        point::AffineCoordinates,
        sec1::ToEncodedPoint,
    },
    schnorr,
};
use rand::Rng;
use thiserror::Error;

use crate::tools::tagged_hash;

pub const HOST_DATA_TAG: &str = "s2c/ecdsa/data";
pub const NONCE_POINT_TAG: &str = "s2c/ecdsa/point";
const BIP340_CHALLENGE_TAG: &str = "BIP0340/challenge";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AntiKleptoError {
    #[error("invalid_signer_commitment")]
    InvalidCommitment,
    #[error("invalid_public_key")]
    InvalidPublicKey,
    #[error("malformed_signature")]
    MalformedSignature,
    #[error("nonce_not_derived_from_commitment")]
    NonceMismatch,
    #[error("signature_does_not_verify")]
    VerificationFailed,
    #[error("recovered_key_mismatch")]
    RecoveryMismatch,
    #[error("invalid_scalar")]
    InvalidScalar,
}

/// The host's secret nonce contribution. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct HostNonce([u8; 32]);

impl HostNonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn commitment(&self) -> [u8; 32] {
        host_commitment(&self.0)
    }
}

impl fmt::Debug for HostNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostNonce(..)")
    }
}

pub fn host_commitment(host_nonce: &[u8; 32]) -> [u8; 32] {
    tagged_hash(HOST_DATA_TAG, &[host_nonce])
}

/// The device's commitment `R1`, a compressed secp256k1 point.
#[derive(Clone, PartialEq, Eq)]
pub struct SignerCommitment {
    bytes: [u8; 33],
    point: AffinePoint,
}

impl SignerCommitment {
    pub fn parse(bytes: &[u8]) -> Result<Self, AntiKleptoError> {
        let bytes: [u8; 33] = bytes
            .try_into()
            .map_err(|_| AntiKleptoError::InvalidCommitment)?;
        if bytes[0] != 0x02 && bytes[0] != 0x03 {
            return Err(AntiKleptoError::InvalidCommitment);
        }
        let point = PublicKey::from_sec1_bytes(&bytes)
            .map_err(|_| AntiKleptoError::InvalidCommitment)?
            .as_affine()
            .to_owned();
        Ok(Self { bytes, point })
    }

    pub fn from_point(point: AffinePoint) -> Self {
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.to_encoded_point(true).as_bytes());
        Self { bytes, point }
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.bytes
    }

    pub fn point(&self) -> &AffinePoint {
        &self.point
    }
}

impl fmt::Debug for SignerCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerCommitment(")?;
        for byte in self.bytes {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

fn reduce(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*bytes))
}

fn x_bytes(point: &AffinePoint) -> [u8; 32] {
    point.x().into()
}

pub fn tweak(commitment: &SignerCommitment, host_nonce: &[u8; 32]) -> Scalar {
    reduce(&tagged_hash(
        NONCE_POINT_TAG,
        &[commitment.as_bytes(), host_nonce],
    ))
}

/// `R1 + t·G`, the nonce point an honest device signs with.
pub fn expected_nonce_point(
    commitment: &SignerCommitment,
    host_nonce: &[u8; 32],
) -> Result<AffinePoint, AntiKleptoError> {
    let t = tweak(commitment, host_nonce);
    let r = ProjectivePoint::from(*commitment.point()) + ProjectivePoint::GENERATOR * t;
    if r == ProjectivePoint::IDENTITY {
        return Err(AntiKleptoError::NonceMismatch);
    }
    Ok(r.to_affine())
}

/// Checks an ECDSA signature over a 32-byte prehash and that its nonce was
/// derived from `commitment` and `host_nonce`.
pub fn verify_ecdsa(
    pubkey_sec1: &[u8],
    digest: &[u8; 32],
    signature: &[u8; 64],
    commitment: &SignerCommitment,
    host_nonce: &[u8; 32],
) -> Result<(), AntiKleptoError> {
    let key = VerifyingKey::from_sec1_bytes(pubkey_sec1)
        .map_err(|_| AntiKleptoError::InvalidPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| AntiKleptoError::MalformedSignature)?;

    let nonce_point = expected_nonce_point(commitment, host_nonce)?;
    let expected_r = reduce(&x_bytes(&nonce_point));
    if *sig.r() != expected_r {
        return Err(AntiKleptoError::NonceMismatch);
    }

    key.verify_prehash(digest, &sig)
        .map_err(|_| AntiKleptoError::VerificationFailed)
}

/// Recovers the signer from an ECDSA signature and compares it to `pubkey_sec1`.
pub fn check_recovery(
    pubkey_sec1: &[u8],
    digest: &[u8; 32],
    signature: &[u8; 64],
    recid: u8,
) -> Result<(), AntiKleptoError> {
    let expected = VerifyingKey::from_sec1_bytes(pubkey_sec1)
        .map_err(|_| AntiKleptoError::InvalidPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| AntiKleptoError::MalformedSignature)?;
    let recid = RecoveryId::from_byte(recid).ok_or(AntiKleptoError::MalformedSignature)?;
    let recovered = VerifyingKey::recover_from_prehash(digest, &sig, recid)
        .map_err(|_| AntiKleptoError::RecoveryMismatch)?;
    if recovered != expected {
        return Err(AntiKleptoError::RecoveryMismatch);
    }
    Ok(())
}

fn bip340_challenge(r_x: &[u8; 32], p_x: &[u8; 32], msg: &[u8; 32]) -> Scalar {
    reduce(&tagged_hash(BIP340_CHALLENGE_TAG, &[r_x, p_x, msg]))
}

/// Checks a BIP-340 signature against an x-only key and the commitment.
pub fn verify_schnorr(
    xonly_pubkey: &[u8; 32],
    msg: &[u8; 32],
    signature: &[u8; 64],
    commitment: &SignerCommitment,
    host_nonce: &[u8; 32],
) -> Result<(), AntiKleptoError> {
    let key = schnorr::VerifyingKey::from_bytes(xonly_pubkey)
        .map_err(|_| AntiKleptoError::InvalidPublicKey)?;
    let sig = schnorr::Signature::try_from(signature.as_slice())
        .map_err(|_| AntiKleptoError::MalformedSignature)?;

    let nonce_point = expected_nonce_point(commitment, host_nonce)?;
    if x_bytes(&nonce_point) != signature[..32] {
        return Err(AntiKleptoError::NonceMismatch);
    }

    key.verify_raw(msg, &sig)
        .map_err(|_| AntiKleptoError::VerificationFailed)
}

/// Device-side half of the protocol, used by simulators and tests.
pub mod signer {
    use k256::elliptic_curve::scalar::IsHigh;

    use super::*;

    fn scalar(bytes: &[u8; 32]) -> Result<Scalar, AntiKleptoError> {
        let s: Scalar = Option::from(Scalar::from_repr(FieldBytes::from(*bytes)))
            .ok_or(AntiKleptoError::InvalidScalar)?;
        if bool::from(s.is_zero()) {
            return Err(AntiKleptoError::InvalidScalar);
        }
        Ok(s)
    }

    pub fn commit(nonce_secret: &[u8; 32]) -> Result<SignerCommitment, AntiKleptoError> {
        let k1 = scalar(nonce_secret)?;
        Ok(SignerCommitment::from_point(
            (ProjectivePoint::GENERATOR * k1).to_affine(),
        ))
    }

    pub fn public_key(secret: &[u8; 32]) -> Result<[u8; 33], AntiKleptoError> {
        let d = scalar(secret)?;
        Ok(*SignerCommitment::from_point((ProjectivePoint::GENERATOR * d).to_affine()).as_bytes())
    }

    pub fn xonly_public_key(secret: &[u8; 32]) -> Result<[u8; 32], AntiKleptoError> {
        let d = scalar(secret)?;
        Ok(x_bytes(&(ProjectivePoint::GENERATOR * d).to_affine()))
    }

    fn tweaked_nonce(
        nonce_secret: &[u8; 32],
        host_nonce: &[u8; 32],
    ) -> Result<(Scalar, AffinePoint), AntiKleptoError> {
        let k1 = scalar(nonce_secret)?;
        let commitment = commit(nonce_secret)?;
        let k = k1 + tweak(&commitment, host_nonce);
        if bool::from(k.is_zero()) {
            return Err(AntiKleptoError::InvalidScalar);
        }
        Ok((k, (ProjectivePoint::GENERATOR * k).to_affine()))
    }

    /// Low-S ECDSA over `digest` with the tweaked nonce. Returns `r || s` and the recovery id.
    pub fn sign_ecdsa(
        secret: &[u8; 32],
        digest: &[u8; 32],
        nonce_secret: &[u8; 32],
        host_nonce: &[u8; 32],
    ) -> Result<([u8; 64], u8), AntiKleptoError> {
        let d = scalar(secret)?;
        let (k, big_r) = tweaked_nonce(nonce_secret, host_nonce)?;
        let r = reduce(&x_bytes(&big_r));
        let z = reduce(digest);
        let k_inv: Scalar = Option::from(k.invert()).ok_or(AntiKleptoError::InvalidScalar)?;
        let mut s = k_inv * (z + r * d);
        if bool::from(r.is_zero()) || bool::from(s.is_zero()) {
            return Err(AntiKleptoError::InvalidScalar);
        }
        let mut recid = u8::from(bool::from(big_r.y_is_odd()));
        if bool::from(s.is_high()) {
            s = -s;
            recid ^= 1;
        }
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&r.to_bytes());
        out[32..].copy_from_slice(&s.to_bytes());
        Ok((out, recid))
    }

    /// BIP-340 signature over `msg` with the tweaked nonce.
    pub fn sign_schnorr(
        secret: &[u8; 32],
        msg: &[u8; 32],
        nonce_secret: &[u8; 32],
        host_nonce: &[u8; 32],
    ) -> Result<[u8; 64], AntiKleptoError> {
        let mut d = scalar(secret)?;
        let p = (ProjectivePoint::GENERATOR * d).to_affine();
        if bool::from(p.y_is_odd()) {
            d = -d;
        }
        let (mut k, big_r) = tweaked_nonce(nonce_secret, host_nonce)?;
        if bool::from(big_r.y_is_odd()) {
            k = -k;
        }
        let r_x = x_bytes(&big_r);
        let e = bip340_challenge(&r_x, &x_bytes(&p), msg);
        let s = k + e * d;
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&r_x);
        out[32..].copy_from_slice(&s.to_bytes());
        Ok(out)
    }
}
