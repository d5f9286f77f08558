//! Inference job record and its lifecycle enums.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{Address, Amount, Nonce, SamplingSeed, TaskId, TaskIdCommitment, Version, B256};

// ── Task type ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    TextGeneration,
    Image,
    FineTune,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextGeneration => "TextGeneration",
            TaskType::Image => "Image",
            TaskType::FineTune => "FineTune",
        }
    }

    /// Dispatch tie-break among equal fees. Higher goes first.
    pub fn dispatch_rank(&self) -> u8 {
        match self {
            TaskType::TextGeneration => 2,
            TaskType::Image => 1,
            TaskType::FineTune => 0,
        }
    }

    /// Image-like results are perceptual digests compared by Hamming distance.
    pub fn compares_by_distance(&self) -> bool {
        !matches!(self, TaskType::TextGeneration)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TextGeneration" => Ok(TaskType::TextGeneration),
            "Image" => Ok(TaskType::Image),
            "FineTune" => Ok(TaskType::FineTune),
            other => Err(CoreError::unknown("task type", other)),
        }
    }
}

// ── Job status ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Started,
    ScoreReady,
    ErrorReported,
    Validated,
    GroupValidated,
    EndInvalidated,
    EndGroupRefund,
    EndSuccess,
    EndGroupSuccess,
    EndAborted,
}

impl JobStatus {
    pub const ALL: [JobStatus; 11] = [
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::ScoreReady,
        JobStatus::ErrorReported,
        JobStatus::Validated,
        JobStatus::GroupValidated,
        JobStatus::EndInvalidated,
        JobStatus::EndGroupRefund,
        JobStatus::EndSuccess,
        JobStatus::EndGroupSuccess,
        JobStatus::EndAborted,
    ];

    /// Statuses from which the job can still move.
    pub const ACTIVE: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::ScoreReady,
        JobStatus::ErrorReported,
        JobStatus::Validated,
        JobStatus::GroupValidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Started => "Started",
            JobStatus::ScoreReady => "ScoreReady",
            JobStatus::ErrorReported => "ErrorReported",
            JobStatus::Validated => "Validated",
            JobStatus::GroupValidated => "GroupValidated",
            JobStatus::EndInvalidated => "EndInvalidated",
            JobStatus::EndGroupRefund => "EndGroupRefund",
            JobStatus::EndSuccess => "EndSuccess",
            JobStatus::EndGroupSuccess => "EndGroupSuccess",
            JobStatus::EndAborted => "EndAborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !Self::ACTIVE.contains(self)
    }

    /// Statuses that have finished executing and await (or went through) validation.
    pub fn is_reported(&self) -> bool {
        matches!(self, JobStatus::ScoreReady | JobStatus::ErrorReported)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::unknown("job status", s))
    }
}

// ── Abort reasons / task errors ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    Timeout,
    ModelDownloadFailed,
    IncorrectResult,
    TaskFeeTooLow,
    IssuerCancelled,
    ValidationIncomplete,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Timeout => "Timeout",
            AbortReason::ModelDownloadFailed => "ModelDownloadFailed",
            AbortReason::IncorrectResult => "IncorrectResult",
            AbortReason::TaskFeeTooLow => "TaskFeeTooLow",
            AbortReason::IssuerCancelled => "IssuerCancelled",
            AbortReason::ValidationIncomplete => "ValidationIncomplete",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbortReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Timeout" => Ok(AbortReason::Timeout),
            "ModelDownloadFailed" => Ok(AbortReason::ModelDownloadFailed),
            "IncorrectResult" => Ok(AbortReason::IncorrectResult),
            "TaskFeeTooLow" => Ok(AbortReason::TaskFeeTooLow),
            "IssuerCancelled" => Ok(AbortReason::IssuerCancelled),
            "ValidationIncomplete" => Ok(AbortReason::ValidationIncomplete),
            other => Err(CoreError::unknown("abort reason", other)),
        }
    }
}

/// Error a worker reports instead of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskError {
    ParametersValidationFailed,
}

impl TaskError {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskError::ParametersValidationFailed => "ParametersValidationFailed",
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskError {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ParametersValidationFailed" => Ok(TaskError::ParametersValidationFailed),
            other => Err(CoreError::unknown("task error", other)),
        }
    }
}

// ── Job ───────────────────────────────────────────────────────

/// Required hardware: an exact GPU model, or only a VRAM floor when `gpu_name` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRequirement {
    pub gpu_name: Option<String>,
    pub gpu_vram: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Creation sequence, assigned by the store.
    pub id: i64,
    pub commitment: TaskIdCommitment,
    /// Only set once revealed at validation.
    pub task_id: Option<TaskId>,
    /// Binds the members of one validated redundancy group.
    pub group_key: Option<B256>,
    pub nonce: Nonce,
    pub sampling_seed: SamplingSeed,
    pub creator: Address,
    pub task_type: TaskType,
    pub task_args: String,
    pub hardware: HardwareRequirement,
    pub model_ids: Vec<String>,
    pub min_version: Version,
    pub fee: Amount,
    pub status: JobStatus,
    pub worker: Option<Address>,
    pub score: Option<Vec<u8>>,
    pub qos_reward: Option<u64>,
    pub abort_reason: Option<AbortReason>,
    pub task_error: Option<TaskError>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub score_ready_at: Option<DateTime<Utc>>,
    pub validated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time between start and the worker's report.
    pub fn execution_duration(&self) -> Option<Duration> {
        match (self.started_at, self.score_ready_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Instant after which the job may be force-aborted. Jobs that never
    /// started count from creation.
    pub fn deadline(&self) -> DateTime<Utc> {
        let from = self.started_at.unwrap_or(self.created_at);
        i64::try_from(self.timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| from.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline()
    }
}
