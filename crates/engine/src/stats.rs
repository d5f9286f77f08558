//! Network statistics rolled up from the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use relay_core::{Address, Amount, EventKind, WorkerStatus};
use relay_store::Store;

use crate::error::RelayError;
use crate::event_log::PaymentPayload;

const EVENT_PAGE: u32 = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub workers_by_status: BTreeMap<String, i64>,
    pub jobs_by_status: BTreeMap<String, i64>,
    /// Sum of every task payment seen so far.
    pub total_fees_paid: Amount,
    /// Payments received per worker.
    pub incentives: BTreeMap<Address, Amount>,
    pub worker_qos: BTreeMap<Address, f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RollupState {
    stats: NetworkStats,
    /// Last event id folded into the payment totals.
    cursor: i64,
}

/// Recomputes [`NetworkStats`]. Counts and QoS are rebuilt on every pass;
/// payment totals accumulate from the event log by cursor.
#[derive(Default)]
pub struct StatsRollup {
    state: RwLock<RollupState>,
}

impl StatsRollup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rollup(&self, store: &dyn Store) -> Result<NetworkStats, RelayError> {
        let mut state = self.state.write().await;
        let mut tx = store.begin().await?;

        let workers_by_status = tx
            .count_workers_by_status()
            .await?
            .into_iter()
            .map(|(status, n)| (status.to_string(), n))
            .collect();
        let jobs_by_status = tx
            .count_jobs_by_status()
            .await?
            .into_iter()
            .map(|(status, n)| (status.to_string(), n))
            .collect();

        let mut worker_qos = BTreeMap::new();
        for status in WorkerStatus::ALL {
            for worker in tx.workers_in_status(status).await? {
                if let Some(score) = worker.qos_score {
                    worker_qos.insert(worker.address, score);
                }
            }
        }

        let mut cursor = state.cursor;
        let mut total = state.stats.total_fees_paid;
        let mut incentives = state.stats.incentives.clone();
        loop {
            let page = tx.events_after(cursor, EVENT_PAGE).await?;
            let Some(last) = page.last() else { break };
            cursor = last.id;
            for event in page.iter().filter(|e| e.kind == EventKind::TaskPayment) {
                match serde_json::from_value::<PaymentPayload>(event.payload.clone()) {
                    Ok(payment) => {
                        total = total.saturating_add(payment.amount);
                        let entry = incentives.entry(payment.worker).or_insert(Amount::ZERO);
                        *entry = entry.saturating_add(payment.amount);
                    }
                    Err(e) => warn!(event_id = event.id, error = %e, "unreadable payment event"),
                }
            }
        }
        tx.rollback().await?;

        state.cursor = cursor;
        state.stats = NetworkStats {
            workers_by_status,
            jobs_by_status,
            total_fees_paid: total,
            incentives,
            worker_qos,
            updated_at: Some(Utc::now()),
        };
        debug!(cursor, total_fees_paid = %total, "network stats rolled up");
        Ok(state.stats.clone())
    }

    /// Last rolled-up stats.
    pub async fn snapshot(&self) -> NetworkStats {
        self.state.read().await.stats.clone()
    }
}
