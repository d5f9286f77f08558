use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relay_core::{
    Address, Amount, Event, Job, JobStatus, ModelCacheEntry, NewEvent, TaskId, TaskIdCommitment,
    Worker, WorkerStatus,
};

use crate::error::StoreError;

/// Entry point of a transactional store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction. Dropping it without `commit` discards every write.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// Blanket implementation so `Arc<dyn Store>` can be used directly.
#[async_trait]
impl<T: Store + ?Sized> Store for Arc<T> {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        (**self).begin().await
    }
}

/// One open transaction.
///
/// Job and worker writes are conditional on the row's status still being the
/// one the caller read (`*_if`), returning `false` when another actor moved
/// first. Balance rows are locked pessimistically with [`StoreTx::lock_balance`].
#[async_trait]
pub trait StoreTx: Send {
    // ── Jobs ──────────────────────────────────────────────────

    /// Insert a new job and return its creation sequence.
    async fn insert_job(&mut self, job: &Job) -> Result<i64, StoreError>;

    async fn job(&mut self, commitment: &TaskIdCommitment) -> Result<Option<Job>, StoreError>;

    /// Write `job` only if the stored status is still `expected`.
    async fn update_job_if(&mut self, job: &Job, expected: JobStatus) -> Result<bool, StoreError>;

    /// Members of a redundancy group, ascending by id. Only jobs whose task id
    /// has been revealed are found.
    async fn jobs_by_task_id(&mut self, task_id: &TaskId) -> Result<Vec<Job>, StoreError>;

    /// Jobs in any of `statuses` with `id > after_id`, ascending by id.
    async fn jobs_in_statuses(
        &mut self,
        statuses: &[JobStatus],
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<Job>, StoreError>;

    /// QoS rewards of the worker's most recent rewarded jobs started at or
    /// after `since`, newest first.
    async fn recent_rewards(
        &mut self,
        worker: &Address,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<u64>, StoreError>;

    async fn count_jobs_by_status(&mut self) -> Result<Vec<(JobStatus, i64)>, StoreError>;

    // ── Workers ───────────────────────────────────────────────

    async fn insert_worker(&mut self, worker: &Worker) -> Result<(), StoreError>;

    async fn worker(&mut self, address: &Address) -> Result<Option<Worker>, StoreError>;

    /// Write `worker` only if the stored status is still `expected`.
    async fn update_worker_if(
        &mut self,
        worker: &Worker,
        expected: WorkerStatus,
    ) -> Result<bool, StoreError>;

    async fn workers_in_status(&mut self, status: WorkerStatus) -> Result<Vec<Worker>, StoreError>;

    /// Largest stake among workers that have not quit.
    async fn max_stake(&mut self) -> Result<Amount, StoreError>;

    async fn count_workers_by_status(&mut self) -> Result<Vec<(WorkerStatus, i64)>, StoreError>;

    // ── Model cache ───────────────────────────────────────────

    async fn model_entries(&mut self, workers: &[Address]) -> Result<Vec<ModelCacheEntry>, StoreError>;

    /// Insert or update the (worker, model) pair.
    async fn upsert_model_entry(&mut self, entry: &ModelCacheEntry) -> Result<(), StoreError>;

    /// Workers in `status` that hold `model_id`.
    async fn workers_with_model(
        &mut self,
        model_id: &str,
        status: WorkerStatus,
    ) -> Result<Vec<Address>, StoreError>;

    // ── Balances ──────────────────────────────────────────────

    /// Lock the balance row for the rest of the transaction, creating it at
    /// zero if absent, and return the current amount.
    async fn lock_balance(&mut self, address: &Address) -> Result<Amount, StoreError>;

    /// Overwrite a balance row previously locked in this transaction.
    async fn set_balance(&mut self, address: &Address, amount: Amount) -> Result<(), StoreError>;

    /// Read a balance without locking or creating it.
    async fn balance(&mut self, address: &Address) -> Result<Amount, StoreError>;

    // ── Events ────────────────────────────────────────────────

    async fn append_event(&mut self, event: &NewEvent) -> Result<i64, StoreError>;

    async fn events_after(&mut self, after_id: i64, limit: u32) -> Result<Vec<Event>, StoreError>;

    // ── Lifecycle ─────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
