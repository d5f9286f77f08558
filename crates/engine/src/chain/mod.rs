//! Chain collaborator seam. The relay never talks to a node directly; it goes
//! through [`ChainClient`], which a deployment backs with a real RPC client.

pub mod anchor;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};

use relay_core::{AbortReason, Address, Amount, EventKind, JobStatus, TaskError, TaskIdCommitment, B256};

pub use anchor::SettlementAnchor;
pub use sync::ChainSync;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chain unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction {0} rejected")]
    Rejected(B256),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// A task-related log read from the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTaskEvent {
    pub block: u64,
    pub kind: ChainEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainEventKind {
    ScoreReady {
        commitment: TaskIdCommitment,
        worker: Address,
        score: Vec<u8>,
    },
    ErrorReported {
        commitment: TaskIdCommitment,
        worker: Address,
        error: TaskError,
    },
    Aborted {
        commitment: TaskIdCommitment,
        issuer: Address,
        reason: AbortReason,
    },
    Deposit {
        address: Address,
        amount: Amount,
        tx_hash: B256,
    },
}

/// On-chain view of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct OnChainTask {
    pub status: JobStatus,
    pub worker: Option<Address>,
    pub score: Option<Vec<u8>>,
    pub error: Option<TaskError>,
    pub abort_reason: Option<AbortReason>,
    pub abort_issuer: Option<Address>,
    pub score_ready_at: Option<DateTime<Utc>>,
}

/// Settlement record submitted for a task event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementTx {
    pub event_id: i64,
    pub kind: EventKind,
    pub commitment: TaskIdCommitment,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed { block: u64 },
    Failed,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Task events in the inclusive block range, in block order.
    async fn task_events(&self, from: u64, to: u64) -> Result<Vec<ChainTaskEvent>, ChainError>;

    async fn task_status(&self, commitment: &TaskIdCommitment) -> Result<Option<OnChainTask>, ChainError>;

    async fn submit_transaction(&self, tx: &SettlementTx) -> Result<B256, ChainError>;

    async fn transaction_status(&self, hash: &B256) -> Result<TxStatus, ChainError>;

    /// New block numbers as they are produced. Ends when the connection drops.
    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, u64>, ChainError>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        (**self).latest_block().await
    }

    async fn task_events(&self, from: u64, to: u64) -> Result<Vec<ChainTaskEvent>, ChainError> {
        (**self).task_events(from, to).await
    }

    async fn task_status(&self, commitment: &TaskIdCommitment) -> Result<Option<OnChainTask>, ChainError> {
        (**self).task_status(commitment).await
    }

    async fn submit_transaction(&self, tx: &SettlementTx) -> Result<B256, ChainError> {
        (**self).submit_transaction(tx).await
    }

    async fn transaction_status(&self, hash: &B256) -> Result<TxStatus, ChainError> {
        (**self).transaction_status(hash).await
    }

    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, u64>, ChainError> {
        (**self).subscribe_blocks().await
    }
}

/// Poll until `hash` is confirmed, failed, or `timeout` passes.
pub async fn wait_for_confirmation(
    client: &dyn ChainClient,
    hash: &B256,
    poll: Duration,
    timeout: Duration,
) -> Result<u64, ChainError> {
    let deadline = Instant::now() + timeout;
    loop {
        match client.transaction_status(hash).await? {
            TxStatus::Confirmed { block } => return Ok(block),
            TxStatus::Failed => return Err(ChainError::Rejected(*hash)),
            TxStatus::Pending => {}
        }
        if Instant::now() >= deadline {
            return Err(ChainError::Timeout(format!("confirmation of {hash}")));
        }
        sleep(poll).await;
    }
}
