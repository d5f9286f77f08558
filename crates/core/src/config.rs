use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{parse_amount, Address, Amount};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Where config keys are read from: the process environment, or a fixed map in tests.
/// Keys are profiled: with profile `PROD`, `PROD_{KEY}` wins over `{KEY}`.
struct Source {
    profile: String,
    fixed: Option<HashMap<String, String>>,
}

impl Source {
    fn raw(&self, key: &str) -> Option<String> {
        let value = match &self.fixed {
            Some(map) => map.get(key).cloned(),
            None => env::var(key).ok(),
        };
        value.filter(|s| !s.is_empty())
    }

    fn opt(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = self.raw(&prefixed) {
                return Some(v);
            }
        }
        self.raw(key)
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    pub relay: RelaySection,
    pub postgres: PostgresConfig,
    pub dispatch: DispatchConfig,
    pub qos: QosConfig,
    pub selection: SelectionConfig,
    pub validation: ValidationConfig,
    pub timeouts: TimeoutConfig,
    pub chain: ChainConfig,
    pub stake: StakeConfig,
}

impl RelayConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `RELAY_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env::var("RELAY_PROFILE").unwrap_or_default().to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        Self::load(&Source {
            profile: profile.to_uppercase(),
            fixed: None,
        })
    }

    /// Build config from explicit key/value pairs, ignoring the process environment.
    pub fn from_pairs(profile: &str, pairs: &[(&str, &str)]) -> Self {
        let fixed = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self::load(&Source {
            profile: profile.to_uppercase(),
            fixed: Some(fixed),
        })
    }

    /// Built-in defaults only.
    pub fn defaults() -> Self {
        Self::from_pairs("", &[])
    }

    fn load(src: &Source) -> Self {
        Self {
            profile: src.profile.clone(),
            relay: RelaySection::load(src),
            postgres: PostgresConfig::load(src),
            dispatch: DispatchConfig::load(src),
            qos: QosConfig::load(src),
            selection: SelectionConfig::load(src),
            validation: ValidationConfig::load(src),
            timeouts: TimeoutConfig::load(src),
            chain: ChainConfig::load(src),
            stake: StakeConfig::load(src),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  relay:       account={}, conflict_retries={}", self.relay.account, self.relay.conflict_retries);
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  dispatch:    page_size={}, capacity={}", self.dispatch.page_size, self.dispatch.queue_capacity);
        tracing::info!("  qos:         rewards={:?}, window={}, kickout={}/{}", self.qos.reward_table, self.qos.score_window, self.qos.kickout_window, self.qos.kickout_threshold);
        tracing::info!("  validation:  hamming_threshold={}", self.validation.hamming_threshold);
        tracing::info!("  timeouts:    job={}s, max={}s", self.timeouts.job_timeout_secs, self.timeouts.max_job_timeout_secs);
        tracing::info!("  chain:       start_block={}", self.chain.start_block);
        tracing::info!("  stake:       min={}", self.stake.min_stake);
    }
}

// ── Relay ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Ledger account that holds escrowed fees and stakes.
    pub account: Address,
    /// Attempts for optimistic-concurrency transitions before giving up.
    pub conflict_retries: u32,
    pub stats_interval_secs: u64,
}

impl RelaySection {
    fn load(src: &Source) -> Self {
        Self {
            account: src.parse_or("RELAY_ACCOUNT", Address::ZERO),
            conflict_retries: src.parse_or("RELAY_CONFLICT_RETRIES", 3),
            stats_interval_secs: src.parse_or("RELAY_STATS_INTERVAL_SECS", 60),
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn load(src: &Source) -> Self {
        Self {
            host: src.or("PG_HOST", "localhost"),
            port: src.parse_or("PG_PORT", 5432),
            database: src.or("PG_DATABASE", "relay"),
            username: src.opt("PG_USERNAME"),
            password: src.opt("PG_PASSWORD"),
            ssl_mode: src.or("PG_SSL_MODE", "prefer"),
            max_connections: src.parse_or("PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Dispatch ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub poll_interval_ms: u64,
    pub page_size: u32,
    pub queue_capacity: usize,
    pub no_worker_backoff_ms: u64,
}

impl DispatchConfig {
    fn load(src: &Source) -> Self {
        Self {
            poll_interval_ms: src.parse_or("DISPATCH_POLL_INTERVAL_MS", 1000),
            page_size: src.parse_or("DISPATCH_PAGE_SIZE", 100),
            queue_capacity: src.parse_or("DISPATCH_QUEUE_CAPACITY", 10_000),
            no_worker_backoff_ms: src.parse_or("DISPATCH_NO_WORKER_BACKOFF_MS", 500),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn no_worker_backoff(&self) -> Duration {
        Duration::from_millis(self.no_worker_backoff_ms)
    }
}

// ── QoS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosConfig {
    /// Rank-ordered rewards, best first.
    pub reward_table: Vec<u64>,
    pub score_window: u32,
    pub kickout_window: u32,
    /// Evict when the padded sum of the kickout window is at or below this.
    pub kickout_threshold: u64,
}

impl QosConfig {
    fn load(src: &Source) -> Self {
        let reward_table = src
            .opt("QOS_REWARD_TABLE")
            .and_then(|v| {
                v.split(',')
                    .map(|p| p.trim().parse::<u64>().ok())
                    .collect::<Option<Vec<_>>>()
            })
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| vec![10, 9, 6]);
        Self {
            reward_table,
            score_window: src.parse_or("QOS_SCORE_WINDOW", 50),
            kickout_window: src.parse_or("QOS_KICKOUT_WINDOW", 3),
            kickout_threshold: src.parse_or("QOS_KICKOUT_THRESHOLD", 10),
        }
    }

    /// Reward of the best rank; also the benefit-of-the-doubt value for new workers.
    pub fn top_reward(&self) -> u64 {
        self.reward_table.first().copied().unwrap_or(0)
    }

    pub fn reward_for_rank(&self, rank: usize) -> u64 {
        self.reward_table.get(rank).copied().unwrap_or(0)
    }
}

// ── Selection ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Minimum number of available workers that should hold each required model.
    pub prefetch_replicas: usize,
}

impl SelectionConfig {
    fn load(src: &Source) -> Self {
        Self {
            prefetch_replicas: src.parse_or("SELECTION_PREFETCH_REPLICAS", 3),
        }
    }
}

// ── Validation ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Image digests agree when their Hamming distance is strictly below this.
    pub hamming_threshold: u32,
    pub group_ready_timeout_secs: u64,
    pub group_poll_interval_ms: u64,
}

impl ValidationConfig {
    fn load(src: &Source) -> Self {
        Self {
            hamming_threshold: src.parse_or("VALIDATION_HAMMING_THRESHOLD", 5),
            group_ready_timeout_secs: src.parse_or("VALIDATION_GROUP_READY_TIMEOUT_SECS", 30),
            group_poll_interval_ms: src.parse_or("VALIDATION_GROUP_POLL_INTERVAL_MS", 500),
        }
    }

    pub fn group_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.group_ready_timeout_secs)
    }

    pub fn group_poll_interval(&self) -> Duration {
        Duration::from_millis(self.group_poll_interval_ms)
    }
}

// ── Timeouts ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub job_timeout_secs: u64,
    /// Upper bound on a caller-supplied job timeout.
    pub max_job_timeout_secs: u64,
    pub deadline_poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
}

impl TimeoutConfig {
    fn load(src: &Source) -> Self {
        Self {
            job_timeout_secs: src.parse_or("JOB_TIMEOUT_SECS", 600),
            max_job_timeout_secs: src.parse_or("JOB_TIMEOUT_MAX_SECS", 7 * 24 * 3600),
            deadline_poll_interval_ms: src.parse_or("DEADLINE_POLL_INTERVAL_MS", 1000),
            sweep_interval_secs: src.parse_or("DEADLINE_SWEEP_INTERVAL_SECS", 30),
        }
    }

    pub fn deadline_poll_interval(&self) -> Duration {
        Duration::from_millis(self.deadline_poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Chain ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub poll_interval_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub start_block: u64,
    pub retry_backoff_ms: u64,
}

impl ChainConfig {
    fn load(src: &Source) -> Self {
        Self {
            poll_interval_ms: src.parse_or("CHAIN_POLL_INTERVAL_MS", 2000),
            confirmation_timeout_secs: src.parse_or("CHAIN_CONFIRMATION_TIMEOUT_SECS", 120),
            start_block: src.parse_or("CHAIN_START_BLOCK", 0),
            retry_backoff_ms: src.parse_or("CHAIN_RETRY_BACKOFF_MS", 5000),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Stake ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeConfig {
    pub min_stake: Amount,
    pub refresh_interval_secs: u64,
}

impl StakeConfig {
    fn load(src: &Source) -> Self {
        Self {
            min_stake: src
                .opt("STAKE_MIN")
                .and_then(|v| parse_amount(&v).ok())
                .unwrap_or(Amount::ZERO),
            refresh_interval_secs: src.parse_or("STAKE_REFRESH_INTERVAL_SECS", 60),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
