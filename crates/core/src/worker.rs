use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{Address, Amount, TaskIdCommitment, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    Quit,
    Available,
    Busy,
    PendingPause,
    PendingQuit,
    Paused,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 6] = [
        WorkerStatus::Quit,
        WorkerStatus::Available,
        WorkerStatus::Busy,
        WorkerStatus::PendingPause,
        WorkerStatus::PendingQuit,
        WorkerStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Quit => "Quit",
            WorkerStatus::Available => "Available",
            WorkerStatus::Busy => "Busy",
            WorkerStatus::PendingPause => "PendingPause",
            WorkerStatus::PendingQuit => "PendingQuit",
            WorkerStatus::Paused => "Paused",
        }
    }

    /// Statuses that carry a current job.
    pub fn is_busy_like(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Busy | WorkerStatus::PendingPause | WorkerStatus::PendingQuit
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::unknown("worker status", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    /// VRAM in GB.
    pub vram: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub address: Address,
    pub status: WorkerStatus,
    pub gpu: GpuInfo,
    pub version: Version,
    /// Rolling average of recent rewards; `None` until the first rewarded job.
    pub qos_score: Option<f64>,
    pub stake: Amount,
    pub current_job: Option<TaskIdCommitment>,
    pub joined_at: DateTime<Utc>,
}

impl Worker {
    /// A worker holds a current job exactly when it is busy-like.
    pub fn assignment_consistent(&self) -> bool {
        self.current_job.is_some() == self.status.is_busy_like()
    }
}

/// A model resident on a worker. `in_use` marks the working set of the current
/// or most recent job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelCacheEntry {
    pub worker: Address,
    pub model_id: String,
    pub in_use: bool,
}
