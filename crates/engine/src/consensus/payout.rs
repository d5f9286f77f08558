//! Final settlement of validated jobs.

use chrono::Utc;
use tracing::info;

use relay_core::{Address, Amount, Job, JobStatus, TaskIdCommitment};

use crate::error::RelayError;
use crate::event_log::{DomainEvent, EventLog};
use crate::ledger::Ledger;
use crate::registry;
use crate::relay::Relay;
use crate::tasks::{expect_status, require_assignment, require_job, write_job};

/// Split `total` over `recipients` in proportion to their rewards.
///
/// Shares are rounded down and the remainder goes to the last recipient, so the
/// payments always sum to `total`. With no rewards at all the last recipient
/// takes everything.
pub fn split_payment(
    total: Amount,
    recipients: &[(Address, u64)],
) -> Result<Vec<(Address, Amount)>, RelayError> {
    let Some(last) = recipients.len().checked_sub(1) else {
        return Err(RelayError::InvalidRequest("payment split without recipients".into()));
    };
    let reward_sum: u64 = recipients.iter().map(|(_, r)| *r).sum();

    let mut payments = Vec::with_capacity(recipients.len());
    let mut paid = Amount::ZERO;
    for (i, (address, reward)) in recipients.iter().enumerate() {
        let amount = if i == last {
            total - paid
        } else if reward_sum == 0 {
            Amount::ZERO
        } else {
            total
                .checked_mul(Amount::from(*reward))
                .ok_or_else(|| RelayError::InvalidRequest("fee too large to split".into()))?
                / Amount::from(reward_sum)
        };
        paid += amount;
        payments.push((*address, amount));
    }
    Ok(payments)
}

/// Reward-ordered recipients of a group: `(duration, id)` order, as ranked at validation.
fn group_recipients(mut members: Vec<Job>) -> Vec<(Address, u64)> {
    members.sort_by_key(|j| {
        (
            j.execution_duration()
                .and_then(|d| d.num_microseconds())
                .unwrap_or(i64::MAX),
            j.id,
        )
    });
    members
        .into_iter()
        .filter_map(|j| j.worker.map(|w| (w, j.qos_reward.unwrap_or(0))))
        .collect()
}

impl Relay {
    /// Pay out a validated job: `Validated` → `EndSuccess`, `GroupValidated` →
    /// `EndGroupSuccess`. Releases the job's worker.
    pub async fn finish_job(&self, commitment: TaskIdCommitment) -> Result<Job, RelayError> {
        let config = self.config.clone();
        let job = self
            .retry("finish_job", move |tx| {
                let config = config.clone();
                Box::pin(async move {
                    let mut job = require_job(tx, &commitment).await?;
                    expect_status(&job, &[JobStatus::Validated, JobStatus::GroupValidated])?;
                    let worker = require_assignment(tx, &job).await?;
                    let relay_account = config.relay.account;

                    let payments = if job.status == JobStatus::Validated {
                        vec![(worker, job.fee)]
                    } else {
                        let (Some(task_id), Some(key)) = (job.task_id, job.group_key) else {
                            return Err(RelayError::InvalidRequest(format!(
                                "task {commitment} was not validated as a group"
                            )));
                        };
                        let members: Vec<Job> = tx
                            .jobs_by_task_id(&task_id)
                            .await?
                            .into_iter()
                            .filter(|j| j.group_key == Some(key))
                            .filter(|j| {
                                matches!(j.status, JobStatus::GroupValidated | JobStatus::EndGroupRefund)
                            })
                            .collect();
                        split_payment(job.fee, &group_recipients(members))?
                    };

                    let mut touched: Vec<Address> = payments.iter().map(|(a, _)| *a).collect();
                    touched.push(relay_account);
                    touched.push(worker);
                    Ledger::lock_all(tx, &touched).await?;
                    for (recipient, amount) in payments {
                        Ledger::transfer(tx, &relay_account, &recipient, amount).await?;
                        EventLog::emit(
                            tx,
                            DomainEvent::TaskPayment { commitment, worker: recipient, amount },
                        )
                        .await?;
                    }

                    let last_status = job.status;
                    job.status = if last_status == JobStatus::Validated {
                        JobStatus::EndSuccess
                    } else {
                        JobStatus::EndGroupSuccess
                    };
                    job.finished_at = Some(Utc::now());
                    write_job(tx, &job, last_status).await?;
                    registry::finish_worker(tx, &config, &worker, commitment).await?;

                    let event = if job.status == JobStatus::EndSuccess {
                        DomainEvent::TaskEndSuccess { commitment, worker }
                    } else {
                        DomainEvent::TaskEndGroupSuccess { commitment, worker }
                    };
                    EventLog::emit(tx, event).await?;
                    Ok(job)
                })
            })
            .await?;
        info!(commitment = %commitment, status = %job.status, fee = %job.fee, "task settled");
        Ok(job)
    }
}
