//! The relay handle: shared store, configuration and selection state.
//!
//! Operations are split over `impl Relay` blocks in the modules that own them
//! (registry, tasks, consensus, dispatch). This file carries construction, the
//! retry helper and the read-only queries.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use relay_core::{Address, Amount, Event, Job, ModelCacheEntry, RelayConfig, TaskIdCommitment, Worker, B256};
use relay_store::{Store, StoreTx};

use crate::error::RelayError;
use crate::event_log::{DomainEvent, EventLog};
use crate::ledger::Ledger;
use crate::retry::with_optimistic_retry;
use crate::selector::{Sampler, StakeNormalizer};

#[derive(Clone)]
pub struct Relay {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: Arc<RelayConfig>,
    pub(crate) stakes: Arc<StakeNormalizer>,
    pub(crate) sampler: Sampler,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, config: RelayConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            stakes: Arc::new(StakeNormalizer::new()),
            sampler: Sampler::from_entropy(),
        }
    }

    /// Replace the selection RNG with a seeded one. Tests only need this.
    pub fn with_sampler_seed(mut self, seed: u64) -> Self {
        self.sampler = Sampler::seeded(seed);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stakes(&self) -> &Arc<StakeNormalizer> {
        &self.stakes
    }

    /// Account that holds escrowed fees and stakes.
    pub fn relay_account(&self) -> Address {
        self.config.relay.account
    }

    /// Run a read-decide-write closure under the configured retry bound.
    pub(crate) async fn retry<T, F>(&self, operation: &str, attempt: F) -> Result<T, RelayError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn StoreTx) -> BoxFuture<'t, Result<T, RelayError>> + Send,
    {
        with_optimistic_retry(
            self.store.as_ref(),
            self.config.relay.conflict_retries,
            operation,
            attempt,
        )
        .await
    }

    // ── Queries ───────────────────────────────────────────────

    pub async fn job(&self, commitment: &TaskIdCommitment) -> Result<Job, RelayError> {
        let mut tx = self.store.begin().await?;
        let job = tx.job(commitment).await?;
        tx.rollback().await?;
        job.ok_or(RelayError::TaskNotFound(*commitment))
    }

    pub async fn worker(&self, address: &Address) -> Result<Worker, RelayError> {
        let mut tx = self.store.begin().await?;
        let worker = tx.worker(address).await?;
        tx.rollback().await?;
        worker.ok_or(RelayError::WorkerNotFound(*address))
    }

    pub async fn worker_current_job(&self, address: &Address) -> Result<Option<Job>, RelayError> {
        let mut tx = self.store.begin().await?;
        let worker = tx
            .worker(address)
            .await?
            .ok_or(RelayError::WorkerNotFound(*address))?;
        let job = match worker.current_job {
            Some(commitment) => tx.job(&commitment).await?,
            None => None,
        };
        tx.rollback().await?;
        Ok(job)
    }

    pub async fn balance(&self, address: &Address) -> Result<Amount, RelayError> {
        let mut tx = self.store.begin().await?;
        let balance = Ledger::balance(tx.as_mut(), address).await?;
        tx.rollback().await?;
        Ok(balance)
    }

    pub async fn worker_models(&self, address: &Address) -> Result<Vec<ModelCacheEntry>, RelayError> {
        let mut tx = self.store.begin().await?;
        let entries = tx.model_entries(std::slice::from_ref(address)).await?;
        tx.rollback().await?;
        Ok(entries)
    }

    pub async fn events_after(&self, cursor: i64, limit: u32) -> Result<Vec<Event>, RelayError> {
        let mut tx = self.store.begin().await?;
        let events = tx.events_after(cursor, limit).await?;
        tx.rollback().await?;
        Ok(events)
    }

    // ── Funding ───────────────────────────────────────────────

    /// Credit funds that entered from outside the ledger.
    pub async fn deposit(
        &self,
        address: Address,
        amount: Amount,
        tx_hash: Option<B256>,
    ) -> Result<(), RelayError> {
        if amount.is_zero() {
            return Err(RelayError::InvalidRequest("deposit amount must be positive".into()));
        }
        self.retry("deposit", move |tx| {
            Box::pin(async move {
                Ledger::credit(tx, &address, amount).await?;
                EventLog::emit(tx, DomainEvent::Deposit { address, amount, tx_hash }).await?;
                Ok(())
            })
        })
        .await?;
        info!(address = %address, amount = %amount, "deposit credited");
        Ok(())
    }
}
