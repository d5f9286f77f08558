//! Worker registry: membership, administrative transitions and the job
//! claim/release pair used by the job state machine.

pub mod models;

use chrono::Utc;
use tracing::{info, warn};

use relay_core::{
    Address, Amount, GpuInfo, RelayConfig, TaskIdCommitment, Version, Worker, WorkerStatus,
};
use relay_store::StoreTx;

use crate::error::RelayError;
use crate::event_log::{DomainEvent, EventLog};
use crate::ledger::Ledger;
use crate::qos::{self, QosVerdict};
use crate::relay::Relay;

/// A worker asking to join the network.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub address: Address,
    pub gpu: GpuInfo,
    pub version: String,
    pub stake: Amount,
    /// Models already present on the machine.
    pub models: Vec<String>,
}

// ── In-transaction helpers ───────────────────────────────────

pub(crate) async fn require_worker(
    tx: &mut dyn StoreTx,
    address: &Address,
) -> Result<Worker, RelayError> {
    tx.worker(address)
        .await?
        .ok_or(RelayError::WorkerNotFound(*address))
}

/// Conditional write; a lost race becomes a retryable conflict.
pub(crate) async fn write_worker(
    tx: &mut dyn StoreTx,
    worker: &Worker,
    expected: WorkerStatus,
) -> Result<(), RelayError> {
    if tx.update_worker_if(worker, expected).await? {
        Ok(())
    } else {
        Err(RelayError::Conflict(format!(
            "worker {} moved from {expected}",
            worker.address
        )))
    }
}

fn illegal(worker: &Worker, action: &'static str) -> RelayError {
    RelayError::IllegalWorkerState {
        worker: worker.address,
        status: worker.status,
        action,
    }
}

/// Attach `commitment` to an available worker and make `required` its working set.
pub(crate) async fn claim(
    tx: &mut dyn StoreTx,
    mut worker: Worker,
    commitment: TaskIdCommitment,
    required: &[String],
) -> Result<Worker, RelayError> {
    if worker.status != WorkerStatus::Available || worker.current_job.is_some() {
        return Err(RelayError::WorkerUnavailable(worker.address));
    }
    models::apply_working_set(tx, &worker.address, required).await?;
    worker.status = WorkerStatus::Busy;
    worker.current_job = Some(commitment);
    write_worker(tx, &worker, WorkerStatus::Available).await?;
    Ok(worker)
}

/// Return a worker's stake from the relay account.
async fn return_stake(
    tx: &mut dyn StoreTx,
    config: &RelayConfig,
    worker: &mut Worker,
) -> Result<Amount, RelayError> {
    let stake = worker.stake;
    Ledger::transfer(tx, &config.relay.account, &worker.address, stake).await?;
    worker.stake = Amount::ZERO;
    Ok(stake)
}

/// Release a worker from `commitment`.
///
/// Runs the kick-out test first. Otherwise refreshes the QoS score and settles
/// any deferred pause or quit. The job row (with its reward) must already be
/// written in `tx`.
pub(crate) async fn finish_worker(
    tx: &mut dyn StoreTx,
    config: &RelayConfig,
    address: &Address,
    commitment: TaskIdCommitment,
) -> Result<Worker, RelayError> {
    let mut worker = require_worker(tx, address).await?;
    if !worker.status.is_busy_like() {
        return Err(illegal(&worker, "finish a job"));
    }
    if worker.current_job != Some(commitment) {
        return Err(RelayError::StaleWorkerAssignment { commitment, worker: *address });
    }
    let previous = worker.status;
    worker.current_job = None;

    match qos::evaluate(tx, address, worker.joined_at, &config.qos).await? {
        QosVerdict::Evict { reward_sum } => {
            let stake_returned = return_stake(tx, config, &mut worker).await?;
            worker.status = WorkerStatus::Quit;
            write_worker(tx, &worker, previous).await?;
            EventLog::emit(
                tx,
                DomainEvent::WorkerKickedOut { worker: *address, reward_sum, stake_returned },
            )
            .await?;
            warn!(worker = %address, reward_sum, "worker kicked out for low QoS");
        }
        QosVerdict::Keep { score } => {
            worker.qos_score = score;
            match previous {
                WorkerStatus::PendingQuit => {
                    let stake_returned = return_stake(tx, config, &mut worker).await?;
                    worker.status = WorkerStatus::Quit;
                    write_worker(tx, &worker, previous).await?;
                    EventLog::emit(
                        tx,
                        DomainEvent::WorkerQuit { worker: *address, stake_returned, deferred: true },
                    )
                    .await?;
                }
                WorkerStatus::PendingPause => {
                    worker.status = WorkerStatus::Paused;
                    write_worker(tx, &worker, previous).await?;
                    EventLog::emit(tx, DomainEvent::WorkerPaused { worker: *address, deferred: true })
                        .await?;
                }
                _ => {
                    worker.status = WorkerStatus::Available;
                    write_worker(tx, &worker, previous).await?;
                }
            }
        }
    }
    Ok(worker)
}

/// Release the job's worker only if it still holds this job.
pub(crate) async fn release_if_holding(
    tx: &mut dyn StoreTx,
    config: &RelayConfig,
    address: &Address,
    commitment: TaskIdCommitment,
) -> Result<Option<Worker>, RelayError> {
    match tx.worker(address).await? {
        Some(w) if w.current_job == Some(commitment) => {
            finish_worker(tx, config, address, commitment).await.map(Some)
        }
        _ => Ok(None),
    }
}

/// Force-quit a worker and keep its stake in the relay account.
pub(crate) async fn slash(
    tx: &mut dyn StoreTx,
    address: &Address,
    commitment: TaskIdCommitment,
) -> Result<Worker, RelayError> {
    let mut worker = require_worker(tx, address).await?;
    if !worker.status.is_busy_like() {
        return Err(illegal(&worker, "be slashed"));
    }
    if worker.current_job != Some(commitment) {
        return Err(RelayError::StaleWorkerAssignment { commitment, worker: *address });
    }
    let previous = worker.status;
    let stake_forfeited = worker.stake;
    worker.stake = Amount::ZERO;
    worker.status = WorkerStatus::Quit;
    worker.current_job = None;
    write_worker(tx, &worker, previous).await?;
    EventLog::emit(
        tx,
        DomainEvent::WorkerSlashed { worker: *address, commitment, stake_forfeited },
    )
    .await?;
    warn!(worker = %address, commitment = %commitment, stake = %stake_forfeited, "worker slashed");
    Ok(worker)
}

// ── Administrative operations ────────────────────────────────

impl Relay {
    pub async fn join(&self, request: JoinRequest) -> Result<Worker, RelayError> {
        let version: Version = request
            .version
            .parse()
            .map_err(|e| RelayError::InvalidRequest(format!("worker version: {e}")))?;
        if request.stake < self.config.stake.min_stake {
            return Err(RelayError::InvalidRequest(format!(
                "stake {} below minimum {}",
                request.stake, self.config.stake.min_stake
            )));
        }

        let config = self.config.clone();
        let worker = self
            .retry("join", move |tx| {
                let config = config.clone();
                let request = request.clone();
                Box::pin(async move {
                    let address = request.address;
                    let previous = tx.worker(&address).await?;
                    if let Some(existing) = &previous {
                        if existing.status != WorkerStatus::Quit {
                            return Err(illegal(existing, "join"));
                        }
                    }

                    Ledger::transfer(tx, &address, &config.relay.account, request.stake).await?;

                    let worker = Worker {
                        address,
                        status: WorkerStatus::Available,
                        gpu: request.gpu.clone(),
                        version,
                        qos_score: previous.as_ref().and_then(|w| w.qos_score),
                        stake: request.stake,
                        current_job: None,
                        joined_at: Utc::now(),
                    };
                    match previous {
                        Some(_) => write_worker(tx, &worker, WorkerStatus::Quit).await?,
                        None => tx.insert_worker(&worker).await?,
                    }
                    for model_id in &request.models {
                        models::record_cached(tx, &address, model_id).await?;
                    }
                    EventLog::emit(tx, DomainEvent::WorkerJoined { worker: address, stake: request.stake })
                        .await?;
                    Ok(worker)
                })
            })
            .await?;
        info!(worker = %worker.address, gpu = %worker.gpu.name, version = %worker.version, "worker joined");
        Ok(worker)
    }

    /// Pause now if idle, after the current job if busy.
    pub async fn pause(&self, address: Address) -> Result<Worker, RelayError> {
        self.retry("pause", move |tx| {
            Box::pin(async move {
                let mut worker = require_worker(tx, &address).await?;
                let previous = worker.status;
                worker.status = match previous {
                    WorkerStatus::Available => WorkerStatus::Paused,
                    WorkerStatus::Busy => WorkerStatus::PendingPause,
                    _ => return Err(illegal(&worker, "pause")),
                };
                write_worker(tx, &worker, previous).await?;
                let deferred = worker.status == WorkerStatus::PendingPause;
                EventLog::emit(tx, DomainEvent::WorkerPaused { worker: address, deferred }).await?;
                Ok(worker)
            })
        })
        .await
    }

    pub async fn resume(&self, address: Address) -> Result<Worker, RelayError> {
        self.retry("resume", move |tx| {
            Box::pin(async move {
                let mut worker = require_worker(tx, &address).await?;
                let previous = worker.status;
                worker.status = match previous {
                    WorkerStatus::Paused => WorkerStatus::Available,
                    WorkerStatus::PendingPause => WorkerStatus::Busy,
                    _ => return Err(illegal(&worker, "resume")),
                };
                write_worker(tx, &worker, previous).await?;
                EventLog::emit(tx, DomainEvent::WorkerResumed { worker: address }).await?;
                Ok(worker)
            })
        })
        .await
    }

    /// Quit now if idle (stake returned), after the current job if busy.
    pub async fn quit(&self, address: Address) -> Result<Worker, RelayError> {
        let config = self.config.clone();
        let worker = self
            .retry("quit", move |tx| {
                let config = config.clone();
                Box::pin(async move {
                    let mut worker = require_worker(tx, &address).await?;
                    let previous = worker.status;
                    let event = match previous {
                        WorkerStatus::Available | WorkerStatus::Paused => {
                            let stake_returned = return_stake(tx, &config, &mut worker).await?;
                            worker.status = WorkerStatus::Quit;
                            DomainEvent::WorkerQuit { worker: address, stake_returned, deferred: false }
                        }
                        WorkerStatus::Busy | WorkerStatus::PendingPause => {
                            worker.status = WorkerStatus::PendingQuit;
                            DomainEvent::WorkerQuit {
                                worker: address,
                                stake_returned: Amount::ZERO,
                                deferred: true,
                            }
                        }
                        _ => return Err(illegal(&worker, "quit")),
                    };
                    write_worker(tx, &worker, previous).await?;
                    EventLog::emit(tx, event).await?;
                    Ok(worker)
                })
            })
            .await?;
        info!(worker = %address, status = %worker.status, "worker quit requested");
        Ok(worker)
    }

    pub async fn set_version(&self, address: Address, version: &str) -> Result<Worker, RelayError> {
        let version: Version = version
            .parse()
            .map_err(|e| RelayError::InvalidRequest(format!("worker version: {e}")))?;
        self.retry("set_version", move |tx| {
            Box::pin(async move {
                let mut worker = require_worker(tx, &address).await?;
                if !matches!(worker.status, WorkerStatus::Available | WorkerStatus::Paused) {
                    return Err(illegal(&worker, "change version"));
                }
                worker.version = version;
                write_worker(tx, &worker, worker.status).await?;
                EventLog::emit(tx, DomainEvent::WorkerVersionChanged { worker: address, version })
                    .await?;
                Ok(worker)
            })
        })
        .await
    }

    /// Record a model the worker downloaded on its own.
    pub async fn add_local_model(&self, address: Address, model_id: &str) -> Result<bool, RelayError> {
        if model_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("model id must not be empty".into()));
        }
        let model_id = model_id.to_string();
        self.retry("add_local_model", move |tx| {
            let model_id = model_id.clone();
            Box::pin(async move {
                let worker = require_worker(tx, &address).await?;
                if worker.status == WorkerStatus::Quit {
                    return Err(illegal(&worker, "add a model"));
                }
                let added = models::record_cached(tx, &address, &model_id).await?;
                if added {
                    EventLog::emit(tx, DomainEvent::WorkerModelAdded { worker: address, model_id })
                        .await?;
                }
                Ok(added)
            })
        })
        .await
    }
}
