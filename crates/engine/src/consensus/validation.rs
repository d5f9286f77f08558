//! Solo and group validation.
//!
//! The creator reveals the task id together with a VRF proof over the job's
//! sampling seed. `r = beta mod 10` decides the path: `r != 0` validates one
//! job on its own, `r == 0` requires three redundant executions that are
//! cross-checked against each other.

use std::collections::BTreeSet;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use relay_core::{AbortReason, Job, JobStatus, TaskId, TaskIdCommitment};

use super::compare::{validity, Outcome};
use super::{commitment, vrf};
use crate::error::RelayError;
use crate::event_log::{DomainEvent, EventLog};
use crate::ledger::Ledger;
use crate::registry;
use crate::relay::Relay;
use crate::tasks::{abort_loaded, expect_status, refund, require_assignment, require_job, write_job};

/// Size of a redundancy group.
pub const GROUP_SIZE: usize = 3;

/// Reveal submitted by the creator for one job.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub commitment: TaskIdCommitment,
    pub task_id: TaskId,
    pub vrf_proof: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Final state of every member of a validated group, ascending by creation.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub jobs: Vec<Job>,
}

impl GroupOutcome {
    /// The job carrying the accepted result, if any result was accepted.
    pub fn canonical(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.status == JobStatus::GroupValidated)
    }
}

/// Check the commitment, the signer and the VRF proof; return the sampling number.
pub fn verify_reveal(job: &Job, request: &ValidationRequest) -> Result<u8, RelayError> {
    if !commitment::verify(&request.task_id, &job.nonce, &job.commitment) {
        return Err(RelayError::CommitmentMismatch(job.commitment));
    }
    let signer = commitment::pubkey_to_address(&request.public_key)?;
    if signer != job.creator {
        return Err(RelayError::Unauthorized { actor: signer, action: "validate task" });
    }
    let beta = vrf::verify(&request.public_key, job.sampling_seed.as_slice(), &request.vrf_proof)?;
    Ok(vrf::sampling_number(&beta))
}

/// Sort key for reward ranking: execution time, then creation sequence.
fn duration_rank(job: &Job) -> (i64, i64) {
    let micros = job
        .execution_duration()
        .and_then(|d| d.num_microseconds())
        .unwrap_or(i64::MAX);
    (micros, job.id)
}

impl Relay {
    /// Validate a job sampled for solo execution.
    pub async fn validate_single(&self, request: ValidationRequest) -> Result<Job, RelayError> {
        let config = self.config.clone();
        let commitment = request.commitment;
        let job = self
            .retry("validate_single", move |tx| {
                let config = config.clone();
                let request = request.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    let mut job = require_job(tx, &request.commitment).await?;
                    expect_status(&job, &[JobStatus::ScoreReady, JobStatus::ErrorReported])?;
                    if verify_reveal(&job, &request)? == 0 {
                        return Err(RelayError::SamplingMismatch(format!(
                            "task {} was sampled for group validation",
                            job.commitment
                        )));
                    }
                    let worker = require_assignment(tx, &job).await?;

                    let qos_reward = config.qos.top_reward();
                    job.task_id = Some(request.task_id);
                    job.validated_at = Some(now);
                    job.qos_reward = Some(qos_reward);

                    if job.status == JobStatus::ErrorReported {
                        return abort_loaded(
                            tx,
                            &config,
                            job,
                            config.relay.account,
                            AbortReason::IncorrectResult,
                            now,
                        )
                        .await;
                    }
                    job.status = JobStatus::Validated;
                    write_job(tx, &job, JobStatus::ScoreReady).await?;
                    EventLog::emit(
                        tx,
                        DomainEvent::TaskValidated { commitment: job.commitment, worker, qos_reward },
                    )
                    .await?;
                    Ok(job)
                })
            })
            .await?;
        info!(commitment = %commitment, status = %job.status, "solo validation done");
        Ok(job)
    }

    /// Validate a redundancy group of exactly three jobs.
    pub async fn validate_group(
        &self,
        requests: Vec<ValidationRequest>,
    ) -> Result<GroupOutcome, RelayError> {
        if requests.len() != GROUP_SIZE {
            return Err(RelayError::InvalidRequest(format!(
                "group validation needs {GROUP_SIZE} tasks, got {}",
                requests.len()
            )));
        }
        let commitments: Vec<TaskIdCommitment> = requests.iter().map(|r| r.commitment).collect();
        if commitments.iter().collect::<BTreeSet<_>>().len() != GROUP_SIZE {
            return Err(RelayError::InvalidRequest("group tasks must be distinct".into()));
        }
        let task_id = requests[0].task_id;
        if requests.iter().any(|r| r.task_id != task_id) {
            return Err(RelayError::InvalidRequest("group tasks reveal different task ids".into()));
        }

        self.wait_group_ready(&commitments).await?;
        let key = commitment::group_key(&commitments);

        let config = self.config.clone();
        let outcome = self
            .retry("validate_group", move |tx| {
                let config = config.clone();
                let requests = requests.clone();
                let commitments = commitments.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    if let Some(other) = tx
                        .jobs_by_task_id(&task_id)
                        .await?
                        .into_iter()
                        .find(|j| !commitments.contains(&j.commitment))
                    {
                        return Err(RelayError::InvalidRequest(format!(
                            "task id {task_id} was already revealed for task {}",
                            other.commitment
                        )));
                    }
                    let mut members: Vec<(Job, ValidationRequest)> = Vec::with_capacity(GROUP_SIZE);
                    for request in requests {
                        let job = require_job(tx, &request.commitment).await?;
                        members.push((job, request));
                    }
                    members.sort_by_key(|(job, _)| job.id);

                    let seed = members[0].0.sampling_seed;
                    let task_type = members[0].0.task_type;
                    for (job, request) in &members {
                        expect_status(
                            job,
                            &[JobStatus::ScoreReady, JobStatus::ErrorReported, JobStatus::EndAborted],
                        )?;
                        if job.sampling_seed != seed {
                            return Err(RelayError::SamplingMismatch(
                                "group tasks do not share a sampling seed".into(),
                            ));
                        }
                        if job.task_type != task_type {
                            return Err(RelayError::InvalidRequest(
                                "group tasks have different task types".into(),
                            ));
                        }
                        if verify_reveal(job, request)? != 0 {
                            return Err(RelayError::SamplingMismatch(format!(
                                "task {} was sampled for solo validation",
                                job.commitment
                            )));
                        }
                    }
                    let mut jobs: Vec<Job> = members.into_iter().map(|(job, _)| job).collect();
                    let mut touched = vec![config.relay.account];
                    touched.extend(jobs.iter().map(|j| j.creator));
                    touched.extend(jobs.iter().filter_map(|j| j.worker));
                    Ledger::lock_all(tx, &touched).await?;

                    let mut ranked: Vec<usize> = (0..jobs.len())
                        .filter(|&i| jobs[i].status != JobStatus::EndAborted)
                        .collect();
                    ranked.sort_by_key(|&i| duration_rank(&jobs[i]));
                    for &i in &ranked {
                        require_assignment(tx, &jobs[i]).await?;
                    }
                    for (rank, &i) in ranked.iter().enumerate() {
                        let job = &mut jobs[i];
                        job.task_id = Some(task_id);
                        job.group_key = Some(key);
                        job.validated_at = Some(now);
                        job.qos_reward = Some(config.qos.reward_for_rank(rank));
                    }

                    if ranked.len() < 2 {
                        for &i in &ranked {
                            jobs[i] = abort_loaded(
                                tx,
                                &config,
                                jobs[i].clone(),
                                config.relay.account,
                                AbortReason::ValidationIncomplete,
                                now,
                            )
                            .await?;
                        }
                        return Ok(GroupOutcome { jobs });
                    }

                    let valid: Vec<bool> = {
                        let mut outcomes = Vec::with_capacity(ranked.len());
                        for &i in &ranked {
                            let outcome = Outcome::of(&jobs[i]).ok_or_else(|| {
                                RelayError::InvalidRequest(format!(
                                    "task {} has no reported result",
                                    jobs[i].commitment
                                ))
                            })?;
                            outcomes.push(outcome);
                        }
                        validity(task_type, &outcomes, config.validation.hamming_threshold)
                    };

                    let mut canonical_taken = false;
                    for (&i, is_valid) in ranked.iter().zip(valid) {
                        let mut job = jobs[i].clone();
                        let commitment = job.commitment;
                        let last_status = job.status;
                        let worker = require_assignment(tx, &job).await?;

                        if is_valid && last_status == JobStatus::ErrorReported {
                            jobs[i] = abort_loaded(
                                tx,
                                &config,
                                job,
                                config.relay.account,
                                AbortReason::IncorrectResult,
                                now,
                            )
                            .await?;
                            continue;
                        }

                        if is_valid && !canonical_taken {
                            canonical_taken = true;
                            job.status = JobStatus::GroupValidated;
                            write_job(tx, &job, last_status).await?;
                            EventLog::emit(
                                tx,
                                DomainEvent::TaskGroupValidated {
                                    commitment,
                                    worker,
                                    qos_reward: job.qos_reward.unwrap_or(0),
                                },
                            )
                            .await?;
                        } else if is_valid {
                            refund(tx, &config, &job).await?;
                            job.status = JobStatus::EndGroupRefund;
                            job.finished_at = Some(now);
                            write_job(tx, &job, last_status).await?;
                            registry::finish_worker(tx, &config, &worker, commitment).await?;
                            EventLog::emit(tx, DomainEvent::TaskEndGroupRefund { commitment, worker })
                                .await?;
                        } else {
                            refund(tx, &config, &job).await?;
                            job.status = JobStatus::EndInvalidated;
                            job.finished_at = Some(now);
                            write_job(tx, &job, last_status).await?;
                            registry::slash(tx, &worker, commitment).await?;
                            EventLog::emit(tx, DomainEvent::TaskEndInvalidated { commitment, worker })
                                .await?;
                        }
                        jobs[i] = job;
                    }
                    Ok(GroupOutcome { jobs })
                })
            })
            .await?;

        let canonical = outcome.canonical().map(|j| j.commitment);
        match canonical {
            Some(c) => info!(task_id = %task_id, canonical = %c, "group validation done"),
            None => warn!(task_id = %task_id, "group validation accepted no result"),
        }
        Ok(outcome)
    }

    /// Poll until no member is still queued or executing.
    async fn wait_group_ready(&self, commitments: &[TaskIdCommitment]) -> Result<(), RelayError> {
        let deadline = Instant::now() + self.config.validation.group_ready_timeout();
        loop {
            let mut tx = self.store.begin().await?;
            let mut pending = 0usize;
            for commitment in commitments {
                let job = require_job(tx.as_mut(), commitment).await?;
                if matches!(job.status, JobStatus::Queued | JobStatus::Started) {
                    pending += 1;
                }
            }
            tx.rollback().await?;

            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RelayError::GroupNotReady(format!(
                    "{pending} of {GROUP_SIZE} tasks still executing"
                )));
            }
            sleep(self.config.validation.group_poll_interval()).await;
        }
    }
}
