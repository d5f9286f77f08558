use thiserror::Error;

use relay_core::{Address, Amount, JobStatus, TaskIdCommitment, WorkerStatus};
use relay_store::StoreError;

use crate::chain::ChainError;
use crate::consensus::vrf::VrfError;

/// Coarse classification that decides how a caller reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input is inconsistent with protocol rules. Never retried.
    Validation,
    /// Another actor moved first. Retried internally.
    Conflict,
    /// Insufficient balance or similar typed outcome.
    Resource,
    /// Retries exhausted.
    Fatal,
    /// Store or chain unavailable. Background drivers back off and retry.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Task {commitment} is {actual}, expected one of {expected:?}")]
    IllegalTaskState {
        commitment: TaskIdCommitment,
        actual: JobStatus,
        expected: Vec<JobStatus>,
    },

    #[error("Worker {worker} is no longer assigned to task {commitment}")]
    StaleWorkerAssignment {
        commitment: TaskIdCommitment,
        worker: Address,
    },

    #[error("Worker {worker} is {status}, cannot {action}")]
    IllegalWorkerState {
        worker: Address,
        status: WorkerStatus,
        action: &'static str,
    },

    #[error("Worker {0} is not available")]
    WorkerUnavailable(Address),

    #[error("Commitment mismatch for task {0}")]
    CommitmentMismatch(TaskIdCommitment),

    #[error("Invalid VRF proof: {0}")]
    InvalidVrfProof(#[from] VrfError),

    #[error("Sampling mismatch: {0}")]
    SamplingMismatch(String),

    #[error("{actor} is not authorized to {action}")]
    Unauthorized {
        actor: Address,
        action: &'static str,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskIdCommitment),

    #[error("Worker not found: {0}")]
    WorkerNotFound(Address),

    #[error("Insufficient balance for {address}: has {available}, needs {required}")]
    InsufficientBalance {
        address: Address,
        available: Amount,
        required: Amount,
    },

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("{operation} gave up after {attempts} conflicting attempts")]
    ConflictExhausted { operation: String, attempts: u32 },

    #[error("Group not ready: {0}")]
    GroupNotReady(String),

    #[error("Event encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::InvalidRequest(_)
            | RelayError::IllegalTaskState { .. }
            | RelayError::StaleWorkerAssignment { .. }
            | RelayError::IllegalWorkerState { .. }
            | RelayError::CommitmentMismatch(_)
            | RelayError::InvalidVrfProof(_)
            | RelayError::SamplingMismatch(_)
            | RelayError::Unauthorized { .. }
            | RelayError::TaskNotFound(_)
            | RelayError::WorkerNotFound(_)
            | RelayError::GroupNotReady(_) => ErrorKind::Validation,
            RelayError::Conflict(_) => ErrorKind::Conflict,
            RelayError::WorkerUnavailable(_) | RelayError::InsufficientBalance { .. } => {
                ErrorKind::Resource
            }
            RelayError::ConflictExhausted { .. } | RelayError::Encoding(_) => ErrorKind::Fatal,
            RelayError::Store(StoreError::Duplicate { .. }) => ErrorKind::Validation,
            RelayError::Store(_) | RelayError::Chain(_) => ErrorKind::Infrastructure,
        }
    }

    /// Machine-readable reason code for API responses.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::IllegalTaskState { .. } => "illegal_task_state",
            RelayError::StaleWorkerAssignment { .. } => "stale_worker_assignment",
            RelayError::IllegalWorkerState { .. } => "illegal_worker_state",
            RelayError::WorkerUnavailable(_) => "worker_unavailable",
            RelayError::CommitmentMismatch(_) => "commitment_mismatch",
            RelayError::InvalidVrfProof(_) => "invalid_vrf_proof",
            RelayError::SamplingMismatch(_) => "sampling_mismatch",
            RelayError::Unauthorized { .. } => "unauthorized",
            RelayError::TaskNotFound(_) => "task_not_found",
            RelayError::WorkerNotFound(_) => "worker_not_found",
            RelayError::InsufficientBalance { .. } => "insufficient_balance",
            RelayError::Conflict(_) => "conflict",
            RelayError::ConflictExhausted { .. } => "conflict_exhausted",
            RelayError::GroupNotReady(_) => "group_not_ready",
            RelayError::Encoding(_) => "encoding",
            RelayError::Store(StoreError::Duplicate { .. }) => "duplicate",
            RelayError::Store(_) => "store_unavailable",
            RelayError::Chain(_) => "chain_unavailable",
        }
    }

    /// Someone else moved the job or worker first; re-read and re-decide.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            RelayError::IllegalTaskState { .. } | RelayError::StaleWorkerAssignment { .. }
        )
    }

    pub(crate) fn illegal_task_state(
        commitment: TaskIdCommitment,
        actual: JobStatus,
        expected: &[JobStatus],
    ) -> Self {
        RelayError::IllegalTaskState {
            commitment,
            actual,
            expected: expected.to_vec(),
        }
    }
}
