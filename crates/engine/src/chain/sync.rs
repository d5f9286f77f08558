//! Applies task events observed on chain to the local state.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use relay_core::{AbortReason, JobStatus, TaskIdCommitment};

use super::{ChainClient, ChainEventKind, ChainTaskEvent};
use crate::error::{ErrorKind, RelayError};
use crate::relay::Relay;
use crate::shutdown::Shutdown;

/// Block-cursor follower of the chain's task events.
///
/// The cursor is `(next_block, applied_in_block)`: events of `next_block` that
/// were applied before an interrupted pass are skipped on the next one, so a
/// deposit is never credited twice within one process lifetime.
pub struct ChainSync {
    relay: Relay,
    client: Arc<dyn ChainClient>,
    next_block: u64,
    applied_in_block: usize,
}

impl ChainSync {
    pub fn new(relay: Relay, client: Arc<dyn ChainClient>) -> Self {
        let next_block = relay.config.chain.start_block;
        Self {
            relay,
            client,
            next_block,
            applied_in_block: 0,
        }
    }

    /// First block not fully applied yet.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Apply every event up to and including block `to`. Returns how many
    /// events changed local state.
    pub async fn sync_to(&mut self, to: u64) -> Result<usize, RelayError> {
        if to < self.next_block {
            return Ok(0);
        }
        let events = self.client.task_events(self.next_block, to).await?;

        let mut changed = 0;
        let mut current = self.next_block;
        let mut seen_in_block = 0usize;
        for event in &events {
            if event.block != current {
                current = event.block;
                seen_in_block = 0;
            }
            seen_in_block += 1;
            if current == self.next_block && seen_in_block <= self.applied_in_block {
                continue;
            }
            if self.apply(event).await? {
                changed += 1;
            }
            self.next_block = current;
            self.applied_in_block = seen_in_block;
        }

        self.next_block = to + 1;
        self.applied_in_block = 0;
        if !events.is_empty() {
            debug!(to, events = events.len(), changed, "chain events applied");
        }
        Ok(changed)
    }

    /// Apply one event. `Ok(false)` when it was already applied or cannot apply.
    pub async fn apply(&self, event: &ChainTaskEvent) -> Result<bool, RelayError> {
        let result = match &event.kind {
            ChainEventKind::ScoreReady { commitment, worker, score } => self
                .relay
                .report_score(*commitment, *worker, score.clone())
                .await
                .map(drop),
            ChainEventKind::ErrorReported { commitment, worker, error } => self
                .relay
                .report_error(*commitment, *worker, *error)
                .await
                .map(drop),
            ChainEventKind::Aborted { commitment, issuer, reason } => self
                .relay
                .force_abort(*commitment, *issuer, *reason)
                .await
                .map(drop),
            ChainEventKind::Deposit { address, amount, tx_hash } => {
                self.relay.deposit(*address, *amount, Some(*tx_hash)).await
            }
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_precondition_failure() => {
                debug!(block = event.block, error = %e, "chain event already applied");
                Ok(false)
            }
            Err(e) if matches!(e.kind(), ErrorKind::Validation | ErrorKind::Resource) => {
                warn!(block = event.block, error = %e, "chain event skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Bring one job in line with its on-chain record. Returns whether local
    /// state changed.
    pub async fn reconcile_job(&self, commitment: TaskIdCommitment) -> Result<bool, RelayError> {
        let Some(remote) = self.client.task_status(&commitment).await? else {
            return Ok(false);
        };
        let local = self.relay.job(&commitment).await?;
        if local.status == remote.status || local.is_terminal() {
            return Ok(false);
        }

        let kind = match remote.status {
            JobStatus::ScoreReady if local.status == JobStatus::Started => {
                match (remote.worker, remote.score) {
                    (Some(worker), Some(score)) => ChainEventKind::ScoreReady { commitment, worker, score },
                    _ => return Ok(false),
                }
            }
            JobStatus::ErrorReported if local.status == JobStatus::Started => {
                match (remote.worker, remote.error) {
                    (Some(worker), Some(error)) => ChainEventKind::ErrorReported { commitment, worker, error },
                    _ => return Ok(false),
                }
            }
            JobStatus::EndAborted => ChainEventKind::Aborted {
                commitment,
                issuer: remote.abort_issuer.unwrap_or(self.relay.relay_account()),
                reason: remote.abort_reason.unwrap_or(AbortReason::IssuerCancelled),
            },
            _ => return Ok(false),
        };

        let changed = self.apply(&ChainTaskEvent { block: self.next_block, kind }).await?;
        if changed {
            info!(commitment = %commitment, status = %remote.status, "task reconciled with chain");
        }
        Ok(changed)
    }

    async fn catch_up(&mut self) -> Result<usize, RelayError> {
        let latest = self.client.latest_block().await?;
        self.sync_to(latest).await
    }

    /// Follow new blocks until shutdown. Subscription drops and infrastructure
    /// errors back off and resume from the cursor.
    pub async fn run(mut self, shutdown: Shutdown) {
        let backoff = self.relay.config.chain.retry_backoff();
        info!(from = self.next_block, "chain sync started");
        'outer: while !shutdown.is_triggered() {
            let mut blocks = match self.client.subscribe_blocks().await {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!(error = %e, "block subscription failed");
                    if !shutdown.sleep(backoff).await {
                        break;
                    }
                    continue;
                }
            };
            if let Err(e) = self.catch_up().await {
                warn!(error = %e, next_block = self.next_block, "chain catch-up failed");
                if !shutdown.sleep(backoff).await {
                    break;
                }
                continue;
            }

            loop {
                let block = tokio::select! {
                    block = blocks.next() => block,
                    _ = shutdown.wait() => break 'outer,
                };
                let Some(block) = block else {
                    warn!("block subscription ended, resubscribing");
                    break;
                };
                if let Err(e) = self.sync_to(block).await {
                    warn!(error = %e, block, next_block = self.next_block, "chain sync failed");
                    if !shutdown.sleep(backoff).await {
                        break 'outer;
                    }
                    break;
                }
            }
        }
        info!(next_block = self.next_block, "chain sync stopped");
    }
}
