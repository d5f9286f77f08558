//! PostgreSQL backend.
//!
//! Amounts travel as text and are cast to/from `NUMERIC` in SQL so no decimal
//! crate is needed on the Rust side.

mod rows;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use relay_core::config::PostgresConfig;
use relay_core::{
    Address, Amount, Event, Job, JobStatus, ModelCacheEntry, NewEvent, TaskId, TaskIdCommitment,
    Worker, WorkerStatus,
};

use crate::error::StoreError;
use crate::traits::{Store, StoreTx};
use rows::{hex, opt_hex, parse_amount_col, EventRow, JobRow, WorkerRow, JOB_COLUMNS, WORKER_COLUMNS};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!("PostgreSQL connected: {}", config.host);
        sqlx::migrate!("../../migrations").run(&pool).await?;
        info!("Database migrations applied successfully");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn duplicate_or(err: sqlx::Error, entity: &'static str, key: String) -> StoreError {
    let unique = err
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if unique {
        StoreError::Duplicate { entity, key }
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    // ── Jobs ──────────────────────────────────────────────────

    async fn insert_job(&mut self, job: &Job) -> Result<i64, StoreError> {
        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (commitment, task_id, nonce, sampling_seed, creator, task_type,
                               task_args, gpu_name, gpu_vram, model_ids, min_version, fee,
                               status, timeout_secs, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12::NUMERIC, $13, $14, $15)
             RETURNING id",
        )
        .bind(hex(job.commitment.as_slice()))
        .bind(opt_hex(job.task_id.as_ref()))
        .bind(hex(job.nonce.as_slice()))
        .bind(hex(job.sampling_seed.as_slice()))
        .bind(hex(job.creator.as_slice()))
        .bind(job.task_type.as_str())
        .bind(&job.task_args)
        .bind(&job.hardware.gpu_name)
        .bind(job.hardware.gpu_vram as i64)
        .bind(&job.model_ids)
        .bind(job.min_version.to_string())
        .bind(job.fee.to_string())
        .bind(job.status.as_str())
        .bind(i64::try_from(job.timeout_secs).unwrap_or(i64::MAX))
        .bind(job.created_at)
        .fetch_one(&mut *self.tx)
        .await;

        result.map_err(|e| duplicate_or(e, "job", job.commitment.to_string()))
    }

    async fn job(&mut self, commitment: &TaskIdCommitment) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE commitment = $1"
        ))
        .bind(hex(commitment.as_slice()))
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn update_job_if(&mut self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET
                task_id = $2,
                group_key = $3,
                status = $4,
                worker = $5,
                score = $6,
                qos_reward = $7,
                abort_reason = $8,
                task_error = $9,
                started_at = $10,
                score_ready_at = $11,
                validated_at = $12,
                finished_at = $13
             WHERE commitment = $1 AND status = $14",
        )
        .bind(hex(job.commitment.as_slice()))
        .bind(opt_hex(job.task_id.as_ref()))
        .bind(opt_hex(job.group_key.as_ref()))
        .bind(job.status.as_str())
        .bind(opt_hex(job.worker.as_ref()))
        .bind(&job.score)
        .bind(job.qos_reward.map(|r| r as i64))
        .bind(job.abort_reason.map(|r| r.as_str()))
        .bind(job.task_error.map(|e| e.as_str()))
        .bind(job.started_at)
        .bind(job.score_ready_at)
        .bind(job.validated_at)
        .bind(job.finished_at)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn jobs_by_task_id(&mut self, task_id: &TaskId) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = $1 ORDER BY id ASC"
        ))
        .bind(hex(task_id.as_slice()))
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn jobs_in_statuses(
        &mut self,
        statuses: &[JobStatus],
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = ANY($1) AND id > $2
             ORDER BY id ASC
             LIMIT $3"
        ))
        .bind(&names)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn recent_rewards(
        &mut self,
        worker: &Address,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<u64>, StoreError> {
        let rewards = sqlx::query_scalar::<_, i64>(
            "SELECT qos_reward FROM jobs
             WHERE worker = $1 AND started_at >= $2 AND qos_reward IS NOT NULL
             ORDER BY id DESC
             LIMIT $3",
        )
        .bind(hex(worker.as_slice()))
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rewards.into_iter().map(|r| r.max(0) as u64).collect())
    }

    async fn count_jobs_by_status(&mut self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|(status, count)| {
                status
                    .parse::<JobStatus>()
                    .map(|s| (s, count))
                    .map_err(|e| StoreError::corrupt("status", e))
            })
            .collect()
    }

    // ── Workers ───────────────────────────────────────────────

    async fn insert_worker(&mut self, worker: &Worker) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO workers (address, status, gpu_name, gpu_vram, version, qos_score,
                                  stake, current_job, joined_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9)",
        )
        .bind(hex(worker.address.as_slice()))
        .bind(worker.status.as_str())
        .bind(&worker.gpu.name)
        .bind(worker.gpu.vram as i64)
        .bind(worker.version.to_string())
        .bind(worker.qos_score)
        .bind(worker.stake.to_string())
        .bind(opt_hex(worker.current_job.as_ref()))
        .bind(worker.joined_at)
        .execute(&mut *self.tx)
        .await;

        result
            .map(|_| ())
            .map_err(|e| duplicate_or(e, "worker", worker.address.to_string()))
    }

    async fn worker(&mut self, address: &Address) -> Result<Option<Worker>, StoreError> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE address = $1"
        ))
        .bind(hex(address.as_slice()))
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Worker::try_from).transpose()
    }

    async fn update_worker_if(
        &mut self,
        worker: &Worker,
        expected: WorkerStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workers SET
                status = $2,
                gpu_name = $3,
                gpu_vram = $4,
                version = $5,
                qos_score = $6,
                stake = $7::NUMERIC,
                current_job = $8,
                joined_at = $9
             WHERE address = $1 AND status = $10",
        )
        .bind(hex(worker.address.as_slice()))
        .bind(worker.status.as_str())
        .bind(&worker.gpu.name)
        .bind(worker.gpu.vram as i64)
        .bind(worker.version.to_string())
        .bind(worker.qos_score)
        .bind(worker.stake.to_string())
        .bind(opt_hex(worker.current_job.as_ref()))
        .bind(worker.joined_at)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn workers_in_status(&mut self, status: WorkerStatus) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE status = $1 ORDER BY address"
        ))
        .bind(status.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn max_stake(&mut self) -> Result<Amount, StoreError> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT COALESCE(MAX(stake), 0)::TEXT FROM workers WHERE status <> 'Quit'",
        )
        .fetch_one(&mut *self.tx)
        .await?;

        parse_amount_col("stake", &raw)
    }

    async fn count_workers_by_status(&mut self) -> Result<Vec<(WorkerStatus, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM workers GROUP BY status",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|(status, count)| {
                status
                    .parse::<WorkerStatus>()
                    .map(|s| (s, count))
                    .map_err(|e| StoreError::corrupt("status", e))
            })
            .collect()
    }

    // ── Model cache ───────────────────────────────────────────

    async fn model_entries(&mut self, workers: &[Address]) -> Result<Vec<ModelCacheEntry>, StoreError> {
        let keys: Vec<String> = workers.iter().map(|w| hex(w.as_slice())).collect();
        let rows = sqlx::query_as::<_, (String, String, bool)>(
            "SELECT worker, model_id, in_use FROM worker_models
             WHERE worker = ANY($1)
             ORDER BY worker, model_id",
        )
        .bind(&keys)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|(worker, model_id, in_use)| {
                let worker = worker
                    .parse::<Address>()
                    .map_err(|e| StoreError::corrupt("worker", e))?;
                Ok(ModelCacheEntry { worker, model_id, in_use })
            })
            .collect()
    }

    async fn upsert_model_entry(&mut self, entry: &ModelCacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO worker_models (worker, model_id, in_use)
             VALUES ($1, $2, $3)
             ON CONFLICT (worker, model_id) DO UPDATE SET in_use = EXCLUDED.in_use",
        )
        .bind(hex(entry.worker.as_slice()))
        .bind(&entry.model_id)
        .bind(entry.in_use)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn workers_with_model(
        &mut self,
        model_id: &str,
        status: WorkerStatus,
    ) -> Result<Vec<Address>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT m.worker FROM worker_models m
             JOIN workers w ON w.address = m.worker
             WHERE m.model_id = $1 AND w.status = $2
             ORDER BY m.worker",
        )
        .bind(model_id)
        .bind(status.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|w| w.parse::<Address>().map_err(|e| StoreError::corrupt("worker", e)))
            .collect()
    }

    // ── Balances ──────────────────────────────────────────────

    async fn lock_balance(&mut self, address: &Address) -> Result<Amount, StoreError> {
        let key = hex(address.as_slice());
        sqlx::query(
            "INSERT INTO balances (address, amount) VALUES ($1, 0)
             ON CONFLICT (address) DO NOTHING",
        )
        .bind(&key)
        .execute(&mut *self.tx)
        .await?;

        let raw = sqlx::query_scalar::<_, String>(
            "SELECT amount::TEXT FROM balances WHERE address = $1 FOR UPDATE",
        )
        .bind(&key)
        .fetch_one(&mut *self.tx)
        .await?;

        parse_amount_col("amount", &raw)
    }

    async fn set_balance(&mut self, address: &Address, amount: Amount) -> Result<(), StoreError> {
        sqlx::query("UPDATE balances SET amount = $2::NUMERIC WHERE address = $1")
            .bind(hex(address.as_slice()))
            .bind(amount.to_string())
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn balance(&mut self, address: &Address) -> Result<Amount, StoreError> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT amount::TEXT FROM balances WHERE address = $1",
        )
        .bind(hex(address.as_slice()))
        .fetch_optional(&mut *self.tx)
        .await?;

        match raw {
            Some(raw) => parse_amount_col("amount", &raw),
            None => Ok(Amount::ZERO),
        }
    }

    // ── Events ────────────────────────────────────────────────

    async fn append_event(&mut self, event: &NewEvent) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO events (kind, worker, commitment, payload)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(event.kind.as_str())
        .bind(opt_hex(event.worker.as_ref()))
        .bind(opt_hex(event.commitment.as_ref()))
        .bind(&event.payload)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn events_after(&mut self, after_id: i64, limit: u32) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, kind, worker, commitment, payload, created_at FROM events
             WHERE id > $1
             ORDER BY id ASC
             LIMIT $2",
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
