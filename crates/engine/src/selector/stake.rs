use std::sync::RwLock;

use tracing::debug;

use relay_core::Amount;
use relay_store::Store;

use crate::error::RelayError;

const PPM: u64 = 1_000_000;

/// Cached maximum stake among active workers, used to normalise selection
/// weights. Refreshed explicitly by a background driver.
#[derive(Debug, Default)]
pub struct StakeNormalizer {
    max: RwLock<Amount>,
}

impl StakeNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_stake(&self) -> Amount {
        *self.max.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_max_stake(&self, max: Amount) {
        *self.max.write().unwrap_or_else(|e| e.into_inner()) = max;
    }

    /// Reload the maximum from the store.
    pub async fn refresh(&self, store: &dyn Store) -> Result<Amount, RelayError> {
        let mut tx = store.begin().await?;
        let max = tx.max_stake().await?;
        tx.rollback().await?;
        self.set_max_stake(max);
        debug!(max_stake = %max, "stake normalizer refreshed");
        Ok(max)
    }

    /// `stake / max_stake` in `[0, 1]` with ppm resolution. 1 when nothing is cached.
    pub fn factor(&self, stake: Amount) -> f64 {
        let max = self.max_stake();
        if max.is_zero() {
            return 1.0;
        }
        let clamped = stake.min(max);
        let ppm = clamped.saturating_mul(Amount::from(PPM)) / max;
        ppm.as_limbs()[0] as f64 / PPM as f64
    }
}
