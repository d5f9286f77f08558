//! Task id commitments and public-key to address mapping.

use alloy_primitives::keccak256;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;

use relay_core::{Address, Nonce, TaskId, TaskIdCommitment, B256};

use super::vrf::VrfError;

/// `keccak256(task_id ‖ nonce)`.
pub fn compute(task_id: &TaskId, nonce: &Nonce) -> TaskIdCommitment {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(task_id.as_slice());
    buf[32..].copy_from_slice(nonce.as_slice());
    keccak256(buf)
}

pub fn verify(task_id: &TaskId, nonce: &Nonce, commitment: &TaskIdCommitment) -> bool {
    compute(task_id, nonce) == *commitment
}

/// Key of a redundancy group: `keccak256` over its sorted commitments.
pub fn group_key(commitments: &[TaskIdCommitment]) -> B256 {
    let mut sorted = commitments.to_vec();
    sorted.sort();
    let mut buf = Vec::with_capacity(sorted.len() * 32);
    for commitment in &sorted {
        buf.extend_from_slice(commitment.as_slice());
    }
    keccak256(buf)
}

/// Parse a SEC1 compressed (33), uncompressed (65) or raw `x ‖ y` (64) key.
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, VrfError> {
    match bytes.len() {
        33 | 65 => PublicKey::from_sec1_bytes(bytes).map_err(|_| VrfError::InvalidPublicKey),
        64 => {
            let mut sec1 = [0u8; 65];
            sec1[0] = 0x04;
            sec1[1..].copy_from_slice(bytes);
            PublicKey::from_sec1_bytes(&sec1).map_err(|_| VrfError::InvalidPublicKey)
        }
        _ => Err(VrfError::InvalidPublicKey),
    }
}

/// Chain address of a public key: last 20 bytes of `keccak256(x ‖ y)`.
pub fn public_key_address(key: &PublicKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

pub fn pubkey_to_address(bytes: &[u8]) -> Result<Address, VrfError> {
    parse_public_key(bytes).map(|key| public_key_address(&key))
}
