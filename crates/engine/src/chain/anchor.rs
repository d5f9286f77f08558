//! Anchors validation and terminal task events on chain, then settles payouts.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use relay_core::{Event, EventKind};

use super::{wait_for_confirmation, ChainClient, ChainError, SettlementTx};
use crate::error::RelayError;
use crate::relay::Relay;
use crate::shutdown::Shutdown;

const PAGE_SIZE: u32 = 100;

fn is_anchored(kind: EventKind) -> bool {
    matches!(kind, EventKind::TaskValidated | EventKind::TaskGroupValidated) || kind.is_task_terminal()
}

pub struct SettlementAnchor {
    relay: Relay,
    client: Arc<dyn ChainClient>,
    cursor: i64,
}

impl SettlementAnchor {
    pub fn new(relay: Relay, client: Arc<dyn ChainClient>) -> Self {
        Self { relay, client, cursor: 0 }
    }

    /// Id of the last event handled.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Submit and confirm the next page of anchorable events. Returns how many
    /// were anchored. The cursor only moves past an event once it is settled
    /// (or rejected for good), so infrastructure errors replay it.
    pub async fn anchor_once(&mut self) -> Result<usize, RelayError> {
        let events = self.relay.events_after(self.cursor, PAGE_SIZE).await?;
        let mut anchored = 0;
        for event in events {
            if is_anchored(event.kind) && self.anchor(&event).await? {
                anchored += 1;
            }
            self.cursor = event.id;
        }
        Ok(anchored)
    }

    async fn anchor(&self, event: &Event) -> Result<bool, RelayError> {
        let Some(commitment) = event.commitment else {
            return Ok(false);
        };
        let settlement = SettlementTx {
            event_id: event.id,
            kind: event.kind,
            commitment,
            payload: event.payload.clone(),
        };
        let chain = &self.relay.config.chain;
        let hash = self.client.submit_transaction(&settlement).await?;
        let block = match wait_for_confirmation(
            self.client.as_ref(),
            &hash,
            chain.poll_interval(),
            chain.confirmation_timeout(),
        )
        .await
        {
            Ok(block) => block,
            Err(ChainError::Rejected(hash)) => {
                error!(event_id = event.id, kind = %event.kind, tx = %hash, "settlement rejected");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(event_id = event.id, kind = %event.kind, block, "settlement confirmed");

        if matches!(event.kind, EventKind::TaskValidated | EventKind::TaskGroupValidated) {
            match self.relay.finish_job(commitment).await {
                Ok(job) => info!(commitment = %commitment, status = %job.status, "task settled"),
                Err(e) if e.is_precondition_failure() => {
                    debug!(commitment = %commitment, error = %e, "task already settled");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        let poll = self.relay.config.chain.poll_interval();
        let backoff = self.relay.config.chain.retry_backoff();
        info!("settlement anchor started");
        while !shutdown.is_triggered() {
            let pause = match self.anchor_once().await {
                Ok(0) => poll,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, cursor = self.cursor, "settlement anchoring failed");
                    backoff
                }
            };
            if !shutdown.sleep(pause).await {
                break;
            }
        }
        info!(cursor = self.cursor, "settlement anchor stopped");
    }
}
