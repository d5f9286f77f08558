//! Typed domain events, persisted in the caller's transaction.

use serde::{Deserialize, Serialize};

use relay_core::{
    AbortReason, Address, Amount, EventKind, JobStatus, NewEvent, TaskError, TaskIdCommitment,
    TaskType, Version, B256,
};
use relay_store::StoreTx;

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    TaskCreated {
        commitment: TaskIdCommitment,
        creator: Address,
        task_type: TaskType,
        fee: Amount,
    },
    TaskStarted {
        commitment: TaskIdCommitment,
        worker: Address,
    },
    TaskScoreReady {
        commitment: TaskIdCommitment,
        worker: Address,
    },
    TaskErrorReported {
        commitment: TaskIdCommitment,
        worker: Address,
        error: TaskError,
    },
    TaskValidated {
        commitment: TaskIdCommitment,
        worker: Address,
        qos_reward: u64,
    },
    TaskGroupValidated {
        commitment: TaskIdCommitment,
        worker: Address,
        qos_reward: u64,
    },
    TaskEndInvalidated {
        commitment: TaskIdCommitment,
        worker: Address,
    },
    TaskEndGroupRefund {
        commitment: TaskIdCommitment,
        worker: Address,
    },
    TaskEndSuccess {
        commitment: TaskIdCommitment,
        worker: Address,
    },
    TaskEndGroupSuccess {
        commitment: TaskIdCommitment,
        worker: Address,
    },
    TaskEndAborted {
        commitment: TaskIdCommitment,
        worker: Option<Address>,
        last_status: JobStatus,
        reason: AbortReason,
        issuer: Address,
    },
    TaskPayment {
        commitment: TaskIdCommitment,
        worker: Address,
        amount: Amount,
    },
    TaskRefund {
        commitment: TaskIdCommitment,
        creator: Address,
        amount: Amount,
    },
    WorkerJoined {
        worker: Address,
        stake: Amount,
    },
    WorkerPaused {
        worker: Address,
        deferred: bool,
    },
    WorkerResumed {
        worker: Address,
    },
    WorkerQuit {
        worker: Address,
        stake_returned: Amount,
        deferred: bool,
    },
    WorkerKickedOut {
        worker: Address,
        reward_sum: u64,
        stake_returned: Amount,
    },
    WorkerSlashed {
        worker: Address,
        commitment: TaskIdCommitment,
        stake_forfeited: Amount,
    },
    WorkerVersionChanged {
        worker: Address,
        version: Version,
    },
    WorkerModelAdded {
        worker: Address,
        model_id: String,
    },
    DownloadModel {
        worker: Address,
        model_id: String,
        commitment: TaskIdCommitment,
    },
    Deposit {
        address: Address,
        amount: Amount,
        tx_hash: Option<B256>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::TaskCreated { .. } => EventKind::TaskCreated,
            DomainEvent::TaskStarted { .. } => EventKind::TaskStarted,
            DomainEvent::TaskScoreReady { .. } => EventKind::TaskScoreReady,
            DomainEvent::TaskErrorReported { .. } => EventKind::TaskErrorReported,
            DomainEvent::TaskValidated { .. } => EventKind::TaskValidated,
            DomainEvent::TaskGroupValidated { .. } => EventKind::TaskGroupValidated,
            DomainEvent::TaskEndInvalidated { .. } => EventKind::TaskEndInvalidated,
            DomainEvent::TaskEndGroupRefund { .. } => EventKind::TaskEndGroupRefund,
            DomainEvent::TaskEndSuccess { .. } => EventKind::TaskEndSuccess,
            DomainEvent::TaskEndGroupSuccess { .. } => EventKind::TaskEndGroupSuccess,
            DomainEvent::TaskEndAborted { .. } => EventKind::TaskEndAborted,
            DomainEvent::TaskPayment { .. } => EventKind::TaskPayment,
            DomainEvent::TaskRefund { .. } => EventKind::TaskRefund,
            DomainEvent::WorkerJoined { .. } => EventKind::WorkerJoined,
            DomainEvent::WorkerPaused { .. } => EventKind::WorkerPaused,
            DomainEvent::WorkerResumed { .. } => EventKind::WorkerResumed,
            DomainEvent::WorkerQuit { .. } => EventKind::WorkerQuit,
            DomainEvent::WorkerKickedOut { .. } => EventKind::WorkerKickedOut,
            DomainEvent::WorkerSlashed { .. } => EventKind::WorkerSlashed,
            DomainEvent::WorkerVersionChanged { .. } => EventKind::WorkerVersionChanged,
            DomainEvent::WorkerModelAdded { .. } => EventKind::WorkerModelAdded,
            DomainEvent::DownloadModel { .. } => EventKind::DownloadModel,
            DomainEvent::Deposit { .. } => EventKind::Deposit,
        }
    }

    /// Worker the event is about, if any.
    pub fn worker(&self) -> Option<Address> {
        match self {
            DomainEvent::TaskStarted { worker, .. }
            | DomainEvent::TaskScoreReady { worker, .. }
            | DomainEvent::TaskErrorReported { worker, .. }
            | DomainEvent::TaskValidated { worker, .. }
            | DomainEvent::TaskGroupValidated { worker, .. }
            | DomainEvent::TaskEndInvalidated { worker, .. }
            | DomainEvent::TaskEndGroupRefund { worker, .. }
            | DomainEvent::TaskEndSuccess { worker, .. }
            | DomainEvent::TaskEndGroupSuccess { worker, .. }
            | DomainEvent::TaskPayment { worker, .. }
            | DomainEvent::WorkerJoined { worker, .. }
            | DomainEvent::WorkerPaused { worker, .. }
            | DomainEvent::WorkerResumed { worker }
            | DomainEvent::WorkerQuit { worker, .. }
            | DomainEvent::WorkerKickedOut { worker, .. }
            | DomainEvent::WorkerSlashed { worker, .. }
            | DomainEvent::WorkerVersionChanged { worker, .. }
            | DomainEvent::WorkerModelAdded { worker, .. }
            | DomainEvent::DownloadModel { worker, .. } => Some(*worker),
            DomainEvent::TaskEndAborted { worker, .. } => *worker,
            DomainEvent::TaskCreated { .. }
            | DomainEvent::TaskRefund { .. }
            | DomainEvent::Deposit { .. } => None,
        }
    }

    /// Job the event is about, if any.
    pub fn commitment(&self) -> Option<TaskIdCommitment> {
        match self {
            DomainEvent::TaskCreated { commitment, .. }
            | DomainEvent::TaskStarted { commitment, .. }
            | DomainEvent::TaskScoreReady { commitment, .. }
            | DomainEvent::TaskErrorReported { commitment, .. }
            | DomainEvent::TaskValidated { commitment, .. }
            | DomainEvent::TaskGroupValidated { commitment, .. }
            | DomainEvent::TaskEndInvalidated { commitment, .. }
            | DomainEvent::TaskEndGroupRefund { commitment, .. }
            | DomainEvent::TaskEndSuccess { commitment, .. }
            | DomainEvent::TaskEndGroupSuccess { commitment, .. }
            | DomainEvent::TaskEndAborted { commitment, .. }
            | DomainEvent::TaskPayment { commitment, .. }
            | DomainEvent::TaskRefund { commitment, .. }
            | DomainEvent::WorkerSlashed { commitment, .. }
            | DomainEvent::DownloadModel { commitment, .. } => Some(*commitment),
            _ => None,
        }
    }

    pub fn to_record(&self) -> Result<NewEvent, RelayError> {
        Ok(NewEvent {
            kind: self.kind(),
            worker: self.worker(),
            commitment: self.commitment(),
            payload: serde_json::to_value(self)?,
        })
    }
}

/// Append-only event log.
pub struct EventLog;

impl EventLog {
    /// Persist `event` in `tx`. Rolled back together with the change it documents.
    pub async fn emit(tx: &mut dyn StoreTx, event: DomainEvent) -> Result<i64, RelayError> {
        let record = event.to_record()?;
        Ok(tx.append_event(&record).await?)
    }
}

/// Payload of a [`EventKind::TaskPayment`] record.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentPayload {
    pub worker: Address,
    pub amount: Amount,
}
