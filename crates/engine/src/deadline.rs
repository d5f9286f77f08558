//! Job deadlines: a watcher per started job and a periodic sweep for jobs
//! whose watcher was lost (restart, crash).

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_core::{AbortReason, Job, JobStatus, TaskIdCommitment};

use crate::error::RelayError;
use crate::relay::Relay;
use crate::shutdown::Shutdown;

/// Statuses a deadline can still cut short.
/// Validated jobs are included: a settlement that never lands must not hold
/// the worker past the deadline.
pub const EXPIRABLE: [JobStatus; 6] = [
    JobStatus::Queued,
    JobStatus::Started,
    JobStatus::ScoreReady,
    JobStatus::ErrorReported,
    JobStatus::Validated,
    JobStatus::GroupValidated,
];

fn expirable(job: &Job) -> bool {
    EXPIRABLE.contains(&job.status)
}

/// Abort `commitment` as timed out. `Ok(false)` when another actor finished it first.
async fn expire(relay: &Relay, commitment: TaskIdCommitment) -> Result<bool, RelayError> {
    match relay
        .abort_job(commitment, relay.relay_account(), AbortReason::Timeout)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_precondition_failure() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Watch one job until it leaves the expirable statuses or its deadline passes.
pub fn spawn_watcher(relay: Relay, commitment: TaskIdCommitment, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll = relay.config.timeouts.deadline_poll_interval();
        loop {
            let job = match relay.job(&commitment).await {
                Ok(job) => job,
                Err(RelayError::TaskNotFound(_)) => return,
                Err(e) => {
                    warn!(commitment = %commitment, error = %e, "deadline watcher read failed");
                    if !shutdown.sleep(poll).await {
                        return;
                    }
                    continue;
                }
            };
            if !expirable(&job) {
                debug!(commitment = %commitment, status = %job.status, "deadline watcher done");
                return;
            }

            let now = Utc::now();
            if job.is_expired(now) {
                match expire(&relay, commitment).await {
                    Ok(true) => {
                        info!(commitment = %commitment, "task timed out");
                        return;
                    }
                    Ok(false) => return,
                    Err(e) => warn!(commitment = %commitment, error = %e, "timeout abort failed"),
                }
            }

            let remaining = (job.deadline() - now).to_std().unwrap_or(Duration::ZERO);
            let wait = if remaining.is_zero() { poll } else { remaining.min(poll) };
            if !shutdown.sleep(wait).await {
                return;
            }
        }
    })
}

impl Relay {
    /// Abort every expirable job past its deadline. Returns how many were aborted.
    pub async fn sweep_expired(&self) -> Result<usize, RelayError> {
        let now = Utc::now();
        let page_size = self.config.dispatch.page_size;
        let mut expired = Vec::new();
        let mut cursor = 0i64;
        loop {
            let mut tx = self.store.begin().await?;
            let page = tx.jobs_in_statuses(&EXPIRABLE, cursor, page_size).await?;
            tx.rollback().await?;
            let Some(last) = page.last() else { break };
            cursor = last.id;
            expired.extend(page.iter().filter(|j| j.is_expired(now)).map(|j| j.commitment));
        }

        let mut aborted = 0;
        for commitment in expired {
            if expire(self, commitment).await? {
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!(aborted, "expired tasks swept");
        }
        Ok(aborted)
    }
}
