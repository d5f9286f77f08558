//! Dispatch: a producer loop feeding queued jobs into the priority queue and a
//! consumer loop assigning them to workers.

pub mod queue;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use relay_core::{Job, JobStatus, TaskIdCommitment};

use crate::deadline;
use crate::error::{ErrorKind, RelayError};
use crate::relay::Relay;
use crate::selector::{dispatch_weights, load_candidates, Requirements};
use crate::shutdown::Shutdown;
use crate::tasks::{expect_status, require_job, start_in_tx};

pub use queue::{DispatchQueue, QueuedJob};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Started(Job),
    /// Nobody capable is free. Not an error: the job goes back in the queue.
    NoWorker,
}

impl Relay {
    /// Select a worker and start `commitment` on it in one transaction.
    pub async fn dispatch_one(&self, commitment: TaskIdCommitment) -> Result<DispatchOutcome, RelayError> {
        let top_reward = self.config.qos.top_reward();
        let stakes = self.stakes.clone();
        let sampler = self.sampler.clone();
        let outcome = self
            .retry("dispatch", move |tx| {
                let stakes = stakes.clone();
                let sampler = sampler.clone();
                Box::pin(async move {
                    let job = require_job(tx, &commitment).await?;
                    expect_status(&job, &[JobStatus::Queued])?;
                    let candidates = load_candidates(tx, &Requirements::from(&job)).await?;
                    let weighted = dispatch_weights(&candidates, &job.model_ids, top_reward, &stakes);
                    let Some(worker) = sampler.pick(&weighted) else {
                        return Ok(DispatchOutcome::NoWorker);
                    };
                    let started = start_in_tx(tx, commitment, worker, Utc::now()).await?;
                    Ok(DispatchOutcome::Started(started))
                })
            })
            .await?;

        if let DispatchOutcome::Started(job) = &outcome {
            info!(
                commitment = %commitment,
                worker = %job.worker.unwrap_or_default(),
                fee = %job.fee,
                "task dispatched"
            );
            self.prefetch_models(job).await;
        }
        Ok(outcome)
    }
}

/// Owns the dispatch loops for one relay.
#[derive(Clone)]
pub struct Dispatcher {
    relay: Relay,
    queue: Arc<DispatchQueue>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(relay: Relay, queue: Arc<DispatchQueue>, shutdown: Shutdown) -> Self {
        Self { relay, queue, shutdown }
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    /// Push one page of queued jobs after `cursor`. Returns the page size; an
    /// empty page resets the cursor.
    pub async fn fill_once(&self, cursor: &mut i64) -> Result<usize, RelayError> {
        let mut tx = self.relay.store.begin().await?;
        let page = tx
            .jobs_in_statuses(&[JobStatus::Queued], *cursor, self.relay.config.dispatch.page_size)
            .await?;
        tx.rollback().await?;

        match page.last() {
            Some(last) => *cursor = last.id,
            None => *cursor = 0,
        }
        let accepted = self.queue.push(page.iter().map(QueuedJob::from));
        if accepted > 0 {
            debug!(fetched = page.len(), accepted, "queued tasks pushed");
        }
        Ok(page.len())
    }

    pub async fn run_producer(self) {
        let poll = self.relay.config.dispatch.poll_interval();
        let backoff = self.relay.config.dispatch.no_worker_backoff();
        let mut cursor = 0i64;
        info!("dispatch producer started");
        while !self.shutdown.is_triggered() {
            let pause = match self.fill_once(&mut cursor).await {
                Ok(0) => poll,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "dispatch producer failed to read queued tasks");
                    backoff.max(poll)
                }
            };
            if !self.shutdown.sleep(pause).await {
                break;
            }
        }
        info!("dispatch producer stopped");
    }

    /// Handle one popped entry.
    pub async fn handle(&self, entry: QueuedJob) {
        let commitment = entry.commitment;
        match self.relay.dispatch_one(commitment).await {
            Ok(DispatchOutcome::Started(_)) => {
                deadline::spawn_watcher(self.relay.clone(), commitment, self.shutdown.clone());
            }
            Ok(DispatchOutcome::NoWorker) => {
                debug!(commitment = %commitment, "no worker available, requeueing");
                self.requeue_later(entry);
            }
            Err(e) if e.is_precondition_failure() || matches!(e, RelayError::TaskNotFound(_)) => {
                debug!(commitment = %commitment, error = %e, "task no longer queued, dropped");
            }
            Err(e) => match e.kind() {
                ErrorKind::Resource | ErrorKind::Conflict => {
                    debug!(commitment = %commitment, error = %e, "dispatch raced, requeueing");
                    self.queue.push([entry]);
                }
                ErrorKind::Validation => {
                    warn!(commitment = %commitment, error = %e, "task cannot be dispatched, dropped");
                }
                ErrorKind::Fatal | ErrorKind::Infrastructure => {
                    warn!(commitment = %commitment, error = %e, "dispatch failed, retrying later");
                    self.requeue_later(entry);
                }
            },
        }
    }

    fn requeue_later(&self, entry: QueuedJob) {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let delay = self.relay.config.dispatch.no_worker_backoff();
        tokio::spawn(async move {
            if shutdown.sleep(delay).await {
                queue.push([entry]);
            }
        });
    }

    pub async fn run_consumer(self) {
        info!("dispatch consumer started");
        while let Some(entry) = self.queue.pop().await {
            self.handle(entry).await;
        }
        info!("dispatch consumer stopped");
    }
}
