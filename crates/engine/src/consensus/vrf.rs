//! ECVRF-SECP256K1-SHA256-TAI.
//!
//! Proofs are `Gamma(33) ‖ c(16) ‖ s(32)`. Hash-to-curve is try-and-increment
//! over compressed points with even y.

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, PublicKey, Scalar, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::commitment::parse_public_key;

const SUITE: u8 = 0xFE;
const PROOF_LEN: usize = 81;
const CHALLENGE_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VrfError {
    #[error("public key is not a valid secp256k1 point")]
    InvalidPublicKey,

    #[error("proof must be {PROOF_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("proof is malformed")]
    MalformedProof,

    #[error("proof does not verify")]
    VerificationFailed,

    #[error("no curve point found for input")]
    HashToCurveFailed,
}

fn compress(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(bytes: &[u8]) -> Option<AffinePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    Option::from(AffinePoint::from_encoded_point(&encoded))
}

fn hash_to_curve(public_key: &[u8], alpha: &[u8]) -> Result<ProjectivePoint, VrfError> {
    for ctr in 0u8..=255 {
        let digest = Sha256::new()
            .chain_update([SUITE, 0x01])
            .chain_update(public_key)
            .chain_update(alpha)
            .chain_update([ctr])
            .finalize();
        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest);
        if let Some(point) = decode_point(&candidate) {
            return Ok(ProjectivePoint::from(point));
        }
    }
    Err(VrfError::HashToCurveFailed)
}

fn challenge(points: [&ProjectivePoint; 4]) -> [u8; CHALLENGE_LEN] {
    let mut hasher = Sha256::new().chain_update([SUITE, 0x02]);
    for point in points {
        hasher.update(compress(point));
    }
    let digest = hasher.finalize();
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(&digest[..CHALLENGE_LEN]);
    out
}

fn challenge_scalar(c: &[u8; CHALLENGE_LEN]) -> Scalar {
    let mut repr = FieldBytes::default();
    repr[32 - CHALLENGE_LEN..].copy_from_slice(c);
    // 128-bit values are always below the group order
    <Scalar as Reduce<k256::U256>>::reduce_bytes(&repr)
}

fn proof_to_hash(gamma: &ProjectivePoint) -> [u8; 32] {
    Sha256::new()
        .chain_update([SUITE, 0x03])
        .chain_update(compress(gamma))
        .finalize()
        .into()
}

/// Verify `proof` for input `alpha` under `public_key` and return the VRF output.
pub fn verify(public_key: &[u8], alpha: &[u8], proof: &[u8]) -> Result<[u8; 32], VrfError> {
    if proof.len() != PROOF_LEN {
        return Err(VrfError::InvalidLength(proof.len()));
    }
    let key = parse_public_key(public_key)?;
    let y = key.to_projective();
    let pk_bytes = compress(&y);

    let gamma = decode_point(&proof[..33])
        .map(ProjectivePoint::from)
        .ok_or(VrfError::MalformedProof)?;
    let mut c_bytes = [0u8; CHALLENGE_LEN];
    c_bytes.copy_from_slice(&proof[33..33 + CHALLENGE_LEN]);
    let c = challenge_scalar(&c_bytes);
    let s_repr = FieldBytes::clone_from_slice(&proof[33 + CHALLENGE_LEN..]);
    let s = Option::<Scalar>::from(Scalar::from_repr(s_repr)).ok_or(VrfError::MalformedProof)?;

    let h = hash_to_curve(&pk_bytes, alpha)?;
    let u = ProjectivePoint::GENERATOR * s - y * c;
    let v = h * s - gamma * c;

    if challenge([&h, &gamma, &u, &v]) != c_bytes {
        return Err(VrfError::VerificationFailed);
    }
    Ok(proof_to_hash(&gamma))
}

/// Produce a proof for `alpha`. Used by clients and tests; the relay only verifies.
pub fn prove(secret: &SecretKey, alpha: &[u8]) -> Result<Vec<u8>, VrfError> {
    let x: Scalar = *secret.to_nonzero_scalar();
    let public: PublicKey = secret.public_key();
    let pk_bytes = compress(&public.to_projective());

    let h = hash_to_curve(&pk_bytes, alpha)?;
    let gamma = h * x;

    // deterministic nonce bound to the key and the hashed input
    let nonce_digest = Sha256::new()
        .chain_update(secret.to_bytes())
        .chain_update(compress(&h))
        .finalize();
    let k = <Scalar as Reduce<k256::U256>>::reduce_bytes(&nonce_digest);

    let c_bytes = challenge([&h, &gamma, &(ProjectivePoint::GENERATOR * k), &(h * k)]);
    let s = k + challenge_scalar(&c_bytes) * x;

    let mut proof = Vec::with_capacity(PROOF_LEN);
    proof.extend_from_slice(&compress(&gamma));
    proof.extend_from_slice(&c_bytes);
    proof.extend_from_slice(&s.to_repr());
    Ok(proof)
}

/// `beta mod 10`, reading the output as a big-endian integer.
pub fn sampling_number(beta: &[u8; 32]) -> u8 {
    beta.iter().fold(0u32, |acc, b| (acc * 256 + *b as u32) % 10) as u8
}
