//! Bounded optimistic-concurrency retry.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use relay_store::{Store, StoreTx};

use crate::error::{ErrorKind, RelayError};

/// Run `attempt` inside a fresh transaction until it commits.
///
/// `Ok` commits. A [`RelayError::Conflict`] rolls back and re-runs the whole
/// read-decide-write closure against fresh state. Any other error rolls back and
/// is returned as is. After `max_attempts` conflicts the result is
/// [`RelayError::ConflictExhausted`].
pub async fn with_optimistic_retry<T, F>(
    store: &dyn Store,
    max_attempts: u32,
    operation: &str,
    mut attempt: F,
) -> Result<T, RelayError>
where
    T: Send,
    F: for<'t> FnMut(&'t mut dyn StoreTx) -> BoxFuture<'t, Result<T, RelayError>> + Send,
{
    let max_attempts = max_attempts.max(1);
    for n in 1..=max_attempts {
        let mut tx = store.begin().await?;
        match attempt(tx.as_mut()).await {
            Ok(value) => {
                tx.commit().await?;
                if n > 1 {
                    debug!(operation, attempt = n, "committed after retry");
                }
                return Ok(value);
            }
            Err(e) if e.kind() == ErrorKind::Conflict => {
                tx.rollback().await?;
                warn!(operation, attempt = n, error = %e, "optimistic conflict, retrying");
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        }
    }
    Err(RelayError::ConflictExhausted {
        operation: operation.to_string(),
        attempts: max_attempts,
    })
}
