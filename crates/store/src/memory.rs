//! In-process store. Each transaction works on a private copy of the whole
//! state and holds the state lock until it commits or is dropped, so
//! transactions are fully serialised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use relay_core::{
    Address, Amount, Event, Job, JobStatus, ModelCacheEntry, NewEvent, TaskId, TaskIdCommitment,
    Worker, WorkerStatus,
};

use crate::error::StoreError;
use crate::traits::{Store, StoreTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    jobs: BTreeMap<i64, Job>,
    job_ids: HashMap<TaskIdCommitment, i64>,
    workers: HashMap<Address, Worker>,
    models: BTreeMap<(Address, String), bool>,
    balances: HashMap<Address, Amount>,
    events: Vec<Event>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every balance row. Used by conservation checks.
    pub async fn total_balance(&self) -> Amount {
        let state = self.state.lock().await;
        state.balances.values().fold(Amount::ZERO, |acc, b| acc + *b)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_job(&mut self, job: &Job) -> Result<i64, StoreError> {
        if self.working.job_ids.contains_key(&job.commitment) {
            return Err(StoreError::Duplicate {
                entity: "job",
                key: job.commitment.to_string(),
            });
        }
        let id = self.working.jobs.keys().next_back().copied().unwrap_or(0) + 1;
        let mut stored = job.clone();
        stored.id = id;
        self.working.job_ids.insert(job.commitment, id);
        self.working.jobs.insert(id, stored);
        Ok(id)
    }

    async fn job(&mut self, commitment: &TaskIdCommitment) -> Result<Option<Job>, StoreError> {
        Ok(self
            .working
            .job_ids
            .get(commitment)
            .and_then(|id| self.working.jobs.get(id))
            .cloned())
    }

    async fn update_job_if(&mut self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        let Some(id) = self.working.job_ids.get(&job.commitment).copied() else {
            return Ok(false);
        };
        match self.working.jobs.get_mut(&id) {
            Some(stored) if stored.status == expected => {
                let mut next = job.clone();
                next.id = id;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn jobs_by_task_id(&mut self, task_id: &TaskId) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .working
            .jobs
            .values()
            .filter(|job| job.task_id.as_ref() == Some(task_id))
            .cloned()
            .collect())
    }

    async fn jobs_in_statuses(
        &mut self,
        statuses: &[JobStatus],
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .working
            .jobs
            .range(after_id + 1..)
            .map(|(_, job)| job)
            .filter(|job| statuses.contains(&job.status))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn recent_rewards(
        &mut self,
        worker: &Address,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .working
            .jobs
            .values()
            .rev()
            .filter(|job| job.worker.as_ref() == Some(worker))
            .filter(|job| job.started_at.map(|t| t >= since).unwrap_or(false))
            .filter_map(|job| job.qos_reward)
            .take(limit as usize)
            .collect())
    }

    async fn count_jobs_by_status(&mut self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for job in self.working.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(JobStatus::ALL
            .iter()
            .filter_map(|s| counts.get(s).map(|c| (*s, *c)))
            .collect())
    }

    async fn insert_worker(&mut self, worker: &Worker) -> Result<(), StoreError> {
        if self.working.workers.contains_key(&worker.address) {
            return Err(StoreError::Duplicate {
                entity: "worker",
                key: worker.address.to_string(),
            });
        }
        self.working.workers.insert(worker.address, worker.clone());
        Ok(())
    }

    async fn worker(&mut self, address: &Address) -> Result<Option<Worker>, StoreError> {
        Ok(self.working.workers.get(address).cloned())
    }

    async fn update_worker_if(
        &mut self,
        worker: &Worker,
        expected: WorkerStatus,
    ) -> Result<bool, StoreError> {
        match self.working.workers.get_mut(&worker.address) {
            Some(stored) if stored.status == expected => {
                *stored = worker.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn workers_in_status(&mut self, status: WorkerStatus) -> Result<Vec<Worker>, StoreError> {
        let mut workers: Vec<Worker> = self
            .working
            .workers
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        workers.sort_by_key(|w| w.address);
        Ok(workers)
    }

    async fn max_stake(&mut self) -> Result<Amount, StoreError> {
        Ok(self
            .working
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Quit)
            .map(|w| w.stake)
            .max()
            .unwrap_or(Amount::ZERO))
    }

    async fn count_workers_by_status(&mut self) -> Result<Vec<(WorkerStatus, i64)>, StoreError> {
        let mut counts: HashMap<WorkerStatus, i64> = HashMap::new();
        for worker in self.working.workers.values() {
            *counts.entry(worker.status).or_default() += 1;
        }
        Ok(WorkerStatus::ALL
            .iter()
            .filter_map(|s| counts.get(s).map(|c| (*s, *c)))
            .collect())
    }

    async fn model_entries(&mut self, workers: &[Address]) -> Result<Vec<ModelCacheEntry>, StoreError> {
        Ok(self
            .working
            .models
            .iter()
            .filter(|((worker, _), _)| workers.contains(worker))
            .map(|((worker, model_id), in_use)| ModelCacheEntry {
                worker: *worker,
                model_id: model_id.clone(),
                in_use: *in_use,
            })
            .collect())
    }

    async fn upsert_model_entry(&mut self, entry: &ModelCacheEntry) -> Result<(), StoreError> {
        self.working
            .models
            .insert((entry.worker, entry.model_id.clone()), entry.in_use);
        Ok(())
    }

    async fn workers_with_model(
        &mut self,
        model_id: &str,
        status: WorkerStatus,
    ) -> Result<Vec<Address>, StoreError> {
        let workers = &self.working.workers;
        Ok(self
            .working
            .models
            .keys()
            .filter(|(_, m)| m == model_id)
            .map(|(worker, _)| *worker)
            .filter(|worker| workers.get(worker).map(|w| w.status == status).unwrap_or(false))
            .collect())
    }

    async fn lock_balance(&mut self, address: &Address) -> Result<Amount, StoreError> {
        Ok(*self.working.balances.entry(*address).or_insert(Amount::ZERO))
    }

    async fn set_balance(&mut self, address: &Address, amount: Amount) -> Result<(), StoreError> {
        self.working.balances.insert(*address, amount);
        Ok(())
    }

    async fn balance(&mut self, address: &Address) -> Result<Amount, StoreError> {
        Ok(self.working.balances.get(address).copied().unwrap_or(Amount::ZERO))
    }

    async fn append_event(&mut self, event: &NewEvent) -> Result<i64, StoreError> {
        let id = self.working.events.len() as i64 + 1;
        self.working.events.push(Event {
            id,
            kind: event.kind,
            worker: event.worker,
            commitment: event.commitment,
            payload: event.payload.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn events_after(&mut self, after_id: i64, limit: u32) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .working
            .events
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{EventKind, GpuInfo, HardwareRequirement, TaskType, Version, B256};

    fn job(seed: u8) -> Job {
        Job {
            id: 0,
            commitment: B256::repeat_byte(seed),
            task_id: None,
            group_key: None,
            nonce: B256::ZERO,
            sampling_seed: B256::ZERO,
            creator: Address::repeat_byte(0xcc),
            task_type: TaskType::TextGeneration,
            task_args: "{}".into(),
            hardware: HardwareRequirement { gpu_name: None, gpu_vram: 8 },
            model_ids: vec![],
            min_version: Version::new(1, 0, 0),
            fee: Amount::from(100u64),
            status: JobStatus::Queued,
            worker: None,
            score: None,
            qos_reward: None,
            abort_reason: None,
            task_error: None,
            timeout_secs: 600,
            created_at: Utc::now(),
            started_at: None,
            score_ready_at: None,
            validated_at: None,
            finished_at: None,
        }
    }

    fn worker(byte: u8) -> Worker {
        Worker {
            address: Address::repeat_byte(byte),
            status: WorkerStatus::Available,
            gpu: GpuInfo { name: "RTX 4090".into(), vram: 24 },
            version: Version::new(1, 0, 0),
            qos_score: None,
            stake: Amount::from(byte as u64),
            current_job: None,
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_job(&job(1)).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.job(&B256::repeat_byte(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_jobs_get_sequential_ids() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.insert_job(&job(1)).await.unwrap(), 1);
        assert_eq!(tx.insert_job(&job(2)).await.unwrap(), 2);
        assert!(matches!(
            tx.insert_job(&job(2)).await,
            Err(StoreError::Duplicate { entity: "job", .. })
        ));
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let page = tx.jobs_in_statuses(&[JobStatus::Queued], 1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 2);
    }

    #[tokio::test]
    async fn conditional_update_checks_status() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_job(&job(1)).await.unwrap();
        let mut started = tx.job(&B256::repeat_byte(1)).await.unwrap().unwrap();
        started.status = JobStatus::Started;
        assert!(tx.update_job_if(&started, JobStatus::Queued).await.unwrap());
        assert!(!tx.update_job_if(&started, JobStatus::Queued).await.unwrap());

        tx.insert_worker(&worker(1)).await.unwrap();
        let mut w = worker(1);
        w.status = WorkerStatus::Paused;
        assert!(!tx.update_worker_if(&w, WorkerStatus::Busy).await.unwrap());
        assert!(tx.update_worker_if(&w, WorkerStatus::Available).await.unwrap());
    }

    #[tokio::test]
    async fn balances_default_to_zero() {
        let store = MemoryStore::new();
        let a = Address::repeat_byte(7);
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(&a).await.unwrap(), Amount::ZERO);
        assert_eq!(tx.lock_balance(&a).await.unwrap(), Amount::ZERO);
        tx.set_balance(&a, Amount::from(42u64)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.total_balance().await, Amount::from(42u64));
    }

    #[tokio::test]
    async fn model_queries_filter_by_status() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_worker(&worker(1)).await.unwrap();
        let mut paused = worker(2);
        paused.status = WorkerStatus::Paused;
        tx.insert_worker(&paused).await.unwrap();
        for byte in [1u8, 2] {
            tx.upsert_model_entry(&ModelCacheEntry {
                worker: Address::repeat_byte(byte),
                model_id: "m".into(),
                in_use: false,
            })
            .await
            .unwrap();
        }
        let holders = tx.workers_with_model("m", WorkerStatus::Available).await.unwrap();
        assert_eq!(holders, vec![Address::repeat_byte(1)]);
        assert_eq!(tx.max_stake().await.unwrap(), Amount::from(2u64));
    }

    #[tokio::test]
    async fn events_are_sequenced() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for _ in 0..3 {
            tx.append_event(&NewEvent {
                kind: EventKind::Deposit,
                worker: None,
                commitment: None,
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        }
        let tail = tx.events_after(1, 10).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
    }
}
