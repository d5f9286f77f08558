//! Identifiers, amounts and semantic versions shared by every crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub use alloy_primitives::{Address, B256, U256};

/// Atomic-unit balance or fee.
pub type Amount = U256;

/// Server-generated task identifier, shared by all members of a redundancy group.
pub type TaskId = B256;

/// Secret nonce bound into a commitment; never leaves the relay before settlement.
pub type Nonce = B256;

/// `keccak256(task_id ‖ nonce)`. The primary identity of a job.
pub type TaskIdCommitment = B256;

/// VRF input shared by the members of a redundancy group.
pub type SamplingSeed = B256;

/// Parse a decimal (or `0x` hex) amount string.
pub fn parse_amount(s: &str) -> Result<Amount, CoreError> {
    let trimmed = s.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x") {
        U256::from_str_radix(hex, 16)
    } else {
        U256::from_str_radix(trimmed, 10)
    };
    parsed.map_err(|_| CoreError::InvalidAmount(s.to_string()))
}

// ── Version ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// True when a worker at `self` may run a job requiring `required`:
    /// same major, and (minor, patch) not older.
    pub fn satisfies(&self, required: &Version) -> bool {
        self.major == required.major && (self.minor, self.patch) >= (required.minor, required.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(CoreError::InvalidVersion(s.to_string()));
        }
        let num = |p: &str| p.parse::<u32>().map_err(|_| CoreError::InvalidVersion(s.to_string()));
        Ok(Version {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}
