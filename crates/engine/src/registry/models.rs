//! Model cache tracking: which models sit on which worker and which of them
//! form the working set of the current job.

use std::collections::BTreeSet;

use relay_core::{Address, ModelCacheEntry};
use relay_store::StoreTx;

use crate::error::RelayError;

/// Entries to write when a worker switches its working set to `required`.
///
/// Required models become in-use (added when absent). Models that were in use
/// but are not required are kept and marked idle. Untouched entries are left out.
pub fn working_set_delta(
    worker: &Address,
    existing: &[ModelCacheEntry],
    required: &[String],
) -> Vec<ModelCacheEntry> {
    let required: BTreeSet<&str> = required.iter().map(String::as_str).collect();
    let mut delta = Vec::new();

    for model_id in &required {
        let already = existing
            .iter()
            .any(|e| e.model_id == *model_id && e.in_use);
        if !already {
            delta.push(ModelCacheEntry {
                worker: *worker,
                model_id: model_id.to_string(),
                in_use: true,
            });
        }
    }
    for entry in existing {
        if entry.in_use && !required.contains(entry.model_id.as_str()) {
            delta.push(ModelCacheEntry {
                worker: *worker,
                model_id: entry.model_id.clone(),
                in_use: false,
            });
        }
    }
    delta
}

pub(crate) async fn apply_working_set(
    tx: &mut dyn StoreTx,
    worker: &Address,
    required: &[String],
) -> Result<(), RelayError> {
    let existing = tx.model_entries(std::slice::from_ref(worker)).await?;
    for entry in working_set_delta(worker, &existing, required) {
        tx.upsert_model_entry(&entry).await?;
    }
    Ok(())
}

/// Record a model as cached, keeping its in-use flag if already known.
/// Returns `false` when it was already recorded.
pub(crate) async fn record_cached(
    tx: &mut dyn StoreTx,
    worker: &Address,
    model_id: &str,
) -> Result<bool, RelayError> {
    let existing = tx.model_entries(std::slice::from_ref(worker)).await?;
    if existing.iter().any(|e| e.model_id == model_id) {
        return Ok(false);
    }
    tx.upsert_model_entry(&ModelCacheEntry {
        worker: *worker,
        model_id: model_id.to_string(),
        in_use: false,
    })
    .await?;
    Ok(true)
}
