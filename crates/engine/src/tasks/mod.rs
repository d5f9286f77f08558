//! Job state machine: creation, start, worker reports and abort.
//!
//! Every transition re-reads the job inside its transaction, checks the
//! expected status (and the worker assignment once started), moves funds,
//! updates the worker, writes the job and emits the event.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use relay_core::{
    AbortReason, Address, Amount, HardwareRequirement, Job, JobStatus, RelayConfig, SamplingSeed,
    TaskError, TaskId, TaskIdCommitment, TaskType, Version, WorkerStatus, B256,
};
use relay_store::StoreTx;

use crate::consensus::commitment;
use crate::error::RelayError;
use crate::event_log::{DomainEvent, EventLog};
use crate::ledger::Ledger;
use crate::registry;
use crate::relay::Relay;
use crate::selector::{is_capable, Requirements};

/// A job submission.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub creator: Address,
    pub task_type: TaskType,
    pub task_args: String,
    pub hardware: HardwareRequirement,
    pub model_ids: Vec<String>,
    pub min_version: String,
    pub fee: Amount,
    /// Reused by the second and third member of a redundancy group.
    pub task_id: Option<TaskId>,
    pub sampling_seed: Option<SamplingSeed>,
    pub timeout_secs: Option<u64>,
}

/// What the creator gets back. The nonce stays with the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedJob {
    pub id: i64,
    pub commitment: TaskIdCommitment,
    pub task_id: TaskId,
    pub sampling_seed: SamplingSeed,
}

// ── In-transaction helpers ───────────────────────────────────

pub(crate) async fn require_job(
    tx: &mut dyn StoreTx,
    commitment: &TaskIdCommitment,
) -> Result<Job, RelayError> {
    tx.job(commitment)
        .await?
        .ok_or(RelayError::TaskNotFound(*commitment))
}

pub(crate) fn expect_status(job: &Job, expected: &[JobStatus]) -> Result<(), RelayError> {
    if expected.contains(&job.status) {
        Ok(())
    } else {
        Err(RelayError::illegal_task_state(job.commitment, job.status, expected))
    }
}

/// Conditional write; a lost race becomes a retryable conflict.
pub(crate) async fn write_job(
    tx: &mut dyn StoreTx,
    job: &Job,
    expected: JobStatus,
) -> Result<(), RelayError> {
    if tx.update_job_if(job, expected).await? {
        Ok(())
    } else {
        Err(RelayError::Conflict(format!("task {} moved from {expected}", job.commitment)))
    }
}

/// The job's worker must still be assigned to it.
pub(crate) async fn require_assignment(tx: &mut dyn StoreTx, job: &Job) -> Result<Address, RelayError> {
    let address = job.worker.ok_or_else(|| {
        RelayError::illegal_task_state(job.commitment, job.status, &[JobStatus::Started])
    })?;
    let worker = registry::require_worker(tx, &address).await?;
    if worker.current_job != Some(job.commitment) {
        return Err(RelayError::StaleWorkerAssignment { commitment: job.commitment, worker: address });
    }
    Ok(address)
}

/// Give the escrowed fee back to the creator.
pub(crate) async fn refund(
    tx: &mut dyn StoreTx,
    config: &RelayConfig,
    job: &Job,
) -> Result<(), RelayError> {
    Ledger::transfer(tx, &config.relay.account, &job.creator, job.fee).await?;
    EventLog::emit(
        tx,
        DomainEvent::TaskRefund { commitment: job.commitment, creator: job.creator, amount: job.fee },
    )
    .await?;
    Ok(())
}

pub(crate) async fn start_in_tx(
    tx: &mut dyn StoreTx,
    commitment: TaskIdCommitment,
    worker: Address,
    now: DateTime<Utc>,
) -> Result<Job, RelayError> {
    let mut job = require_job(tx, &commitment).await?;
    expect_status(&job, &[JobStatus::Queued])?;

    let candidate = registry::require_worker(tx, &worker).await?;
    if !is_capable(&candidate, &Requirements::from(&job)) {
        return Err(RelayError::WorkerUnavailable(worker));
    }
    registry::claim(tx, candidate, commitment, &job.model_ids).await?;

    job.status = JobStatus::Started;
    job.worker = Some(worker);
    job.started_at = Some(now);
    write_job(tx, &job, JobStatus::Queued).await?;
    EventLog::emit(tx, DomainEvent::TaskStarted { commitment, worker }).await?;
    Ok(job)
}

/// Abort a loaded job without authorisation checks.
///
/// Refunds the fee, records a zero reward for an assigned worker that has none
/// yet, and releases the worker if it still holds the job. `job` may carry
/// in-memory edits (e.g. a reward); its stored status must still be `job.status`.
pub(crate) async fn abort_loaded(
    tx: &mut dyn StoreTx,
    config: &RelayConfig,
    mut job: Job,
    issuer: Address,
    reason: AbortReason,
    now: DateTime<Utc>,
) -> Result<Job, RelayError> {
    if job.is_terminal() {
        return Err(RelayError::illegal_task_state(
            job.commitment,
            job.status,
            &JobStatus::ACTIVE,
        ));
    }
    let last_status = job.status;
    let mut touched = vec![config.relay.account, job.creator];
    touched.extend(job.worker);
    Ledger::lock_all(tx, &touched).await?;
    refund(tx, config, &job).await?;

    if job.worker.is_some() && job.qos_reward.is_none() {
        job.qos_reward = Some(0);
    }
    job.status = JobStatus::EndAborted;
    job.abort_reason = Some(reason);
    job.finished_at = Some(now);
    write_job(tx, &job, last_status).await?;

    if let Some(worker) = job.worker {
        registry::release_if_holding(tx, config, &worker, job.commitment).await?;
    }
    EventLog::emit(
        tx,
        DomainEvent::TaskEndAborted {
            commitment: job.commitment,
            worker: job.worker,
            last_status,
            reason,
            issuer,
        },
    )
    .await?;
    Ok(job)
}

fn authorize_abort(
    job: &Job,
    issuer: &Address,
    relay_account: &Address,
    now: DateTime<Utc>,
) -> Result<(), RelayError> {
    let allowed = if issuer == relay_account {
        true
    } else if *issuer == job.creator {
        job.status == JobStatus::Queued || job.is_expired(now)
    } else if Some(*issuer) == job.worker {
        job.status == JobStatus::Started
    } else {
        false
    };
    if allowed {
        Ok(())
    } else {
        Err(RelayError::Unauthorized { actor: *issuer, action: "abort task" })
    }
}

// ── Entry points ─────────────────────────────────────────────

impl Relay {
    /// Escrow the fee and queue a new job.
    pub async fn create_job(&self, request: NewJob) -> Result<CreatedJob, RelayError> {
        if request.fee.is_zero() {
            return Err(RelayError::InvalidRequest("fee must be positive".into()));
        }
        let timeout_secs = request.timeout_secs.unwrap_or(self.config.timeouts.job_timeout_secs);
        if timeout_secs > self.config.timeouts.max_job_timeout_secs {
            return Err(RelayError::InvalidRequest(format!(
                "timeout of {timeout_secs}s exceeds the {}s limit",
                self.config.timeouts.max_job_timeout_secs
            )));
        }
        let min_version: Version = request
            .min_version
            .parse()
            .map_err(|e| RelayError::InvalidRequest(format!("minimum version: {e}")))?;

        let mut model_ids: Vec<String> = Vec::with_capacity(request.model_ids.len());
        for model_id in request.model_ids {
            if model_id.trim().is_empty() {
                return Err(RelayError::InvalidRequest("model id must not be empty".into()));
            }
            if !model_ids.contains(&model_id) {
                model_ids.push(model_id);
            }
        }

        let nonce = B256::random();
        let task_id = request.task_id.unwrap_or_else(B256::random);
        let sampling_seed = request.sampling_seed.unwrap_or_else(B256::random);
        let commitment = commitment::compute(&task_id, &nonce);
        let now = Utc::now();

        let job = Job {
            id: 0,
            commitment,
            task_id: None,
            group_key: None,
            nonce,
            sampling_seed,
            creator: request.creator,
            task_type: request.task_type,
            task_args: request.task_args,
            hardware: request.hardware,
            model_ids,
            min_version,
            fee: request.fee,
            status: JobStatus::Queued,
            worker: None,
            score: None,
            qos_reward: None,
            abort_reason: None,
            task_error: None,
            timeout_secs,
            created_at: now,
            started_at: None,
            score_ready_at: None,
            validated_at: None,
            finished_at: None,
        };

        let relay_account = self.relay_account();
        let id = self
            .retry("create_job", move |tx| {
                let job = job.clone();
                Box::pin(async move {
                    Ledger::transfer(tx, &job.creator, &relay_account, job.fee).await?;
                    let id = tx.insert_job(&job).await?;
                    EventLog::emit(
                        tx,
                        DomainEvent::TaskCreated {
                            commitment: job.commitment,
                            creator: job.creator,
                            task_type: job.task_type,
                            fee: job.fee,
                        },
                    )
                    .await?;
                    Ok(id)
                })
            })
            .await?;

        info!(commitment = %commitment, id, task_type = %request.task_type, "task created");
        Ok(CreatedJob { id, commitment, task_id, sampling_seed })
    }

    /// Queued → Started on `worker`, then best-effort model pre-fetch.
    pub async fn start_job(
        &self,
        commitment: TaskIdCommitment,
        worker: Address,
    ) -> Result<Job, RelayError> {
        let job = self
            .retry("start_job", move |tx| {
                Box::pin(async move { start_in_tx(tx, commitment, worker, Utc::now()).await })
            })
            .await?;
        info!(commitment = %commitment, worker = %worker, "task started");
        self.prefetch_models(&job).await;
        Ok(job)
    }

    /// Started → ScoreReady. Must come from the assigned worker.
    pub async fn report_score(
        &self,
        commitment: TaskIdCommitment,
        worker: Address,
        score: Vec<u8>,
    ) -> Result<Job, RelayError> {
        if score.is_empty() {
            return Err(RelayError::InvalidRequest("result digest must not be empty".into()));
        }
        let job = self
            .retry("report_score", move |tx| {
                let score = score.clone();
                Box::pin(async move {
                    let mut job = require_job(tx, &commitment).await?;
                    expect_status(&job, &[JobStatus::Started])?;
                    if job.worker != Some(worker) {
                        return Err(RelayError::Unauthorized { actor: worker, action: "report a result" });
                    }
                    require_assignment(tx, &job).await?;

                    job.status = JobStatus::ScoreReady;
                    job.score = Some(score);
                    job.score_ready_at = Some(Utc::now());
                    write_job(tx, &job, JobStatus::Started).await?;
                    EventLog::emit(tx, DomainEvent::TaskScoreReady { commitment, worker }).await?;
                    Ok(job)
                })
            })
            .await?;
        debug!(commitment = %commitment, worker = %worker, "score reported");
        Ok(job)
    }

    /// Started → ErrorReported. Must come from the assigned worker.
    pub async fn report_error(
        &self,
        commitment: TaskIdCommitment,
        worker: Address,
        error: TaskError,
    ) -> Result<Job, RelayError> {
        let job = self
            .retry("report_error", move |tx| {
                Box::pin(async move {
                    let mut job = require_job(tx, &commitment).await?;
                    expect_status(&job, &[JobStatus::Started])?;
                    if job.worker != Some(worker) {
                        return Err(RelayError::Unauthorized { actor: worker, action: "report an error" });
                    }
                    require_assignment(tx, &job).await?;

                    job.status = JobStatus::ErrorReported;
                    job.task_error = Some(error);
                    job.score_ready_at = Some(Utc::now());
                    write_job(tx, &job, JobStatus::Started).await?;
                    EventLog::emit(tx, DomainEvent::TaskErrorReported { commitment, worker, error })
                        .await?;
                    Ok(job)
                })
            })
            .await?;
        debug!(commitment = %commitment, worker = %worker, error = %error, "error reported");
        Ok(job)
    }

    /// Abort on behalf of `issuer`: the relay itself, the creator (while queued
    /// or past the deadline) or the assigned worker (while started).
    pub async fn abort_job(
        &self,
        commitment: TaskIdCommitment,
        issuer: Address,
        reason: AbortReason,
    ) -> Result<Job, RelayError> {
        let config = self.config.clone();
        let job = self
            .retry("abort_job", move |tx| {
                let config = config.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    let job = require_job(tx, &commitment).await?;
                    if job.is_terminal() {
                        return Err(RelayError::illegal_task_state(
                            commitment,
                            job.status,
                            &JobStatus::ACTIVE,
                        ));
                    }
                    authorize_abort(&job, &issuer, &config.relay.account, now)?;
                    abort_loaded(tx, &config, job, issuer, reason, now).await
                })
            })
            .await?;
        info!(commitment = %commitment, issuer = %issuer, reason = %reason, "task aborted");
        Ok(job)
    }

    /// Abort without the issuer check, for aborts already confirmed on chain.
    pub(crate) async fn force_abort(
        &self,
        commitment: TaskIdCommitment,
        issuer: Address,
        reason: AbortReason,
    ) -> Result<Job, RelayError> {
        let config = self.config.clone();
        self.retry("force_abort", move |tx| {
            let config = config.clone();
            Box::pin(async move {
                let job = require_job(tx, &commitment).await?;
                abort_loaded(tx, &config, job, issuer, reason, Utc::now()).await
            })
        })
        .await
    }

    /// Ask extra workers to download the job's models when fewer than the
    /// replica target hold them. Failures are logged and dropped.
    pub async fn prefetch_models(&self, job: &Job) {
        let target = self.config.selection.prefetch_replicas;
        for model_id in &job.model_ids {
            if let Err(e) = self.prefetch_model(job, model_id, target).await {
                warn!(commitment = %job.commitment, model = %model_id, error = %e, "model pre-fetch failed");
            }
        }
    }

    async fn prefetch_model(&self, job: &Job, model_id: &str, target: usize) -> Result<usize, RelayError> {
        let mut tx = self.store.begin().await?;
        let holders = tx
            .workers_with_model(model_id, WorkerStatus::Available)
            .await?
            .len();
        tx.rollback().await?;
        if holders >= target {
            return Ok(0);
        }

        let chosen = self.select_prefetch_workers(job, model_id, target - holders).await?;
        if chosen.is_empty() {
            return Ok(0);
        }
        let commitment = job.commitment;
        let model = model_id.to_string();
        let count = chosen.len();
        self.retry("prefetch", move |tx| {
            let chosen = chosen.clone();
            let model = model.clone();
            Box::pin(async move {
                for worker in chosen {
                    EventLog::emit(
                        tx,
                        DomainEvent::DownloadModel { worker, model_id: model.clone(), commitment },
                    )
                    .await?;
                }
                Ok(())
            })
        })
        .await?;
        debug!(commitment = %commitment, model = %model_id, workers = count, "model pre-fetch requested");
        Ok(count)
    }
}
