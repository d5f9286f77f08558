//! Rolling QoS score and the trailing-window eviction test.

use chrono::{DateTime, Utc};

use relay_core::config::QosConfig;
use relay_core::Address;
use relay_store::StoreTx;

use crate::error::RelayError;

/// Outcome of scoring a worker that just finished a job.
#[derive(Debug, Clone, PartialEq)]
pub enum QosVerdict {
    /// Padded reward sum fell to or below the threshold.
    Evict { reward_sum: u64 },
    Keep { score: Option<f64> },
}

/// Sum of the newest `window` rewards, padding missing slots with `top`.
pub fn padded_window_sum(newest_first: &[u64], window: usize, top: u64) -> u64 {
    let seen: u64 = newest_first.iter().take(window).sum();
    let missing = window.saturating_sub(newest_first.len()) as u64;
    seen + missing * top
}

pub fn should_evict(newest_first: &[u64], config: &QosConfig) -> bool {
    padded_window_sum(newest_first, config.kickout_window as usize, config.top_reward())
        <= config.kickout_threshold
}

/// Mean reward, `None` for a worker with no history.
pub fn average(rewards: &[u64]) -> Option<f64> {
    if rewards.is_empty() {
        None
    } else {
        Some(rewards.iter().sum::<u64>() as f64 / rewards.len() as f64)
    }
}

/// Score a worker from its stored history since `joined_at`.
pub async fn evaluate(
    tx: &mut dyn StoreTx,
    worker: &Address,
    joined_at: DateTime<Utc>,
    config: &QosConfig,
) -> Result<QosVerdict, RelayError> {
    let rewards = tx
        .recent_rewards(worker, joined_at, config.score_window.max(config.kickout_window))
        .await?;
    if should_evict(&rewards, config) {
        let reward_sum =
            padded_window_sum(&rewards, config.kickout_window as usize, config.top_reward());
        return Ok(QosVerdict::Evict { reward_sum });
    }
    let window = &rewards[..rewards.len().min(config.score_window as usize)];
    Ok(QosVerdict::Keep { score: average(window) })
}
