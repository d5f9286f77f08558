//! Row types and conversions between SQL columns and domain types.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use alloy_primitives::hex::encode_prefixed;
use relay_core::{
    parse_amount, Address, Amount, Event, GpuInfo, HardwareRequirement, Job, Worker, B256,
};

use crate::error::StoreError;

pub(crate) const JOB_COLUMNS: &str = "id, commitment, task_id, group_key, nonce, sampling_seed, creator, \
     task_type, task_args, gpu_name, gpu_vram, model_ids, min_version, fee::TEXT AS fee, status, \
     worker, score, qos_reward, abort_reason, task_error, timeout_secs, created_at, started_at, \
     score_ready_at, validated_at, finished_at";

pub(crate) const WORKER_COLUMNS: &str = "address, status, gpu_name, gpu_vram, version, qos_score, \
     stake::TEXT AS stake, current_job, joined_at";

pub(crate) fn hex(bytes: &[u8]) -> String {
    encode_prefixed(bytes)
}

pub(crate) fn opt_hex<T: AsRef<[u8]>>(value: Option<&T>) -> Option<String> {
    value.map(|v| encode_prefixed(v.as_ref()))
}

fn parse_col<T: FromStr>(column: &'static str, raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| StoreError::corrupt(column, format!("{raw}: {e}")))
}

fn parse_opt<T: FromStr>(column: &'static str, raw: Option<String>) -> Result<Option<T>, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.map(|r| parse_col(column, &r)).transpose()
}

pub(crate) fn parse_amount_col(column: &'static str, raw: &str) -> Result<Amount, StoreError> {
    parse_amount(raw).map_err(|e| StoreError::corrupt(column, e))
}

fn non_negative(column: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|e| StoreError::corrupt(column, e))
}

// ── Jobs ──────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub commitment: String,
    pub task_id: Option<String>,
    pub group_key: Option<String>,
    pub nonce: String,
    pub sampling_seed: String,
    pub creator: String,
    pub task_type: String,
    pub task_args: String,
    pub gpu_name: Option<String>,
    pub gpu_vram: i64,
    pub model_ids: Vec<String>,
    pub min_version: String,
    pub fee: String,
    pub status: String,
    pub worker: Option<String>,
    pub score: Option<Vec<u8>>,
    pub qos_reward: Option<i64>,
    pub abort_reason: Option<String>,
    pub task_error: Option<String>,
    pub timeout_secs: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub score_ready_at: Option<DateTime<Utc>>,
    pub validated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            commitment: parse_col::<B256>("commitment", &row.commitment)?,
            task_id: parse_opt::<B256>("task_id", row.task_id)?,
            group_key: parse_opt::<B256>("group_key", row.group_key)?,
            nonce: parse_col::<B256>("nonce", &row.nonce)?,
            sampling_seed: parse_col::<B256>("sampling_seed", &row.sampling_seed)?,
            creator: parse_col::<Address>("creator", &row.creator)?,
            task_type: parse_col("task_type", &row.task_type)?,
            task_args: row.task_args,
            hardware: HardwareRequirement {
                gpu_name: row.gpu_name,
                gpu_vram: non_negative("gpu_vram", row.gpu_vram)?,
            },
            model_ids: row.model_ids,
            min_version: parse_col("min_version", &row.min_version)?,
            fee: parse_amount_col("fee", &row.fee)?,
            status: parse_col("status", &row.status)?,
            worker: parse_opt::<Address>("worker", row.worker)?,
            score: row.score,
            qos_reward: row.qos_reward.map(|r| non_negative("qos_reward", r)).transpose()?,
            abort_reason: parse_opt("abort_reason", row.abort_reason)?,
            task_error: parse_opt("task_error", row.task_error)?,
            timeout_secs: non_negative("timeout_secs", row.timeout_secs)?,
            created_at: row.created_at,
            started_at: row.started_at,
            score_ready_at: row.score_ready_at,
            validated_at: row.validated_at,
            finished_at: row.finished_at,
        })
    }
}

// ── Workers ───────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkerRow {
    pub address: String,
    pub status: String,
    pub gpu_name: String,
    pub gpu_vram: i64,
    pub version: String,
    pub qos_score: Option<f64>,
    pub stake: String,
    pub current_job: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = StoreError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        Ok(Worker {
            address: parse_col::<Address>("address", &row.address)?,
            status: parse_col("status", &row.status)?,
            gpu: GpuInfo {
                name: row.gpu_name,
                vram: non_negative("gpu_vram", row.gpu_vram)?,
            },
            version: parse_col("version", &row.version)?,
            qos_score: row.qos_score,
            stake: parse_amount_col("stake", &row.stake)?,
            current_job: parse_opt::<B256>("current_job", row.current_job)?,
            joined_at: row.joined_at,
        })
    }
}

// ── Events ────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: i64,
    pub kind: String,
    pub worker: Option<String>,
    pub commitment: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            id: row.id,
            kind: parse_col("kind", &row.kind)?,
            worker: parse_opt::<Address>("worker", row.worker)?,
            commitment: parse_opt::<B256>("commitment", row.commitment)?,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}
