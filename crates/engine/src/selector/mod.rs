//! Capability filter and weighted worker selection.
//!
//! Filtering and weighting are pure functions over loaded candidates so the
//! random draw can be driven by a seeded RNG in tests. [`load_candidates`]
//! gathers the inputs from a transaction.

mod stake;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use relay_core::{Address, GpuInfo, HardwareRequirement, Job, Version, Worker, WorkerStatus};
use relay_store::StoreTx;

use crate::error::RelayError;
use crate::relay::Relay;

pub use stake::StakeNormalizer;

/// What a job needs from a worker.
#[derive(Debug, Clone, Copy)]
pub struct Requirements<'a> {
    pub hardware: &'a HardwareRequirement,
    pub min_version: &'a Version,
    pub model_ids: &'a [String],
}

impl<'a> From<&'a Job> for Requirements<'a> {
    fn from(job: &'a Job) -> Self {
        Requirements {
            hardware: &job.hardware,
            min_version: &job.min_version,
            model_ids: &job.model_ids,
        }
    }
}

/// An available worker together with its model cache.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker: Worker,
    pub cached: BTreeSet<String>,
    pub in_use: BTreeSet<String>,
}

fn hardware_matches(gpu: &GpuInfo, required: &HardwareRequirement) -> bool {
    match &required.gpu_name {
        Some(name) => gpu.name == *name && gpu.vram == required.gpu_vram,
        None => gpu.vram >= required.gpu_vram,
    }
}

pub fn is_capable(worker: &Worker, req: &Requirements<'_>) -> bool {
    worker.status == WorkerStatus::Available
        && worker.current_job.is_none()
        && worker.version.satisfies(req.min_version)
        && hardware_matches(&worker.gpu, req.hardware)
}

/// Selection weight of one candidate.
///
/// Base is the worker's QoS score (`top_reward` when it has none) scaled by its
/// stake factor. With `locality`, the weight is multiplied by the number of
/// required models already cached, and doubled again when the in-use set is
/// exactly the required set.
pub fn weight(
    candidate: &Candidate,
    required: &[String],
    top_reward: u64,
    stake_factor: f64,
    locality: bool,
) -> f64 {
    let base = candidate.worker.qos_score.unwrap_or(top_reward as f64);
    let mut w = base * stake_factor;
    if locality {
        let hits = required.iter().filter(|m| candidate.cached.contains(*m)).count();
        if hits > 0 {
            w *= hits as f64;
        }
        let required_set: BTreeSet<&str> = required.iter().map(String::as_str).collect();
        let in_use_set: BTreeSet<&str> = candidate.in_use.iter().map(String::as_str).collect();
        if !required_set.is_empty() && required_set == in_use_set {
            w *= 2.0;
        }
    }
    w
}

/// Weighted draw. Falls back to a uniform draw when every weight is zero.
pub fn pick<R: Rng + ?Sized>(weighted: &[(Address, f64)], rng: &mut R) -> Option<Address> {
    if weighted.is_empty() {
        return None;
    }
    let index = match WeightedIndex::new(weighted.iter().map(|(_, w)| w.max(0.0))) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.gen_range(0..weighted.len()),
    };
    Some(weighted[index].0)
}

/// Up to `n` distinct workers drawn without replacement.
pub fn pick_many<R: Rng + ?Sized>(weighted: &[(Address, f64)], n: usize, rng: &mut R) -> Vec<Address> {
    let mut pool = weighted.to_vec();
    let mut chosen = Vec::with_capacity(n.min(pool.len()));
    while chosen.len() < n {
        let Some(address) = pick(&pool, rng) else { break };
        pool.retain(|(a, _)| *a != address);
        chosen.push(address);
    }
    chosen
}

/// Shared RNG for selection draws. Seedable so dispatch is reproducible in tests.
#[derive(Clone)]
pub struct Sampler {
    rng: Arc<Mutex<StdRng>>,
}

impl Sampler {
    pub fn from_entropy() -> Self {
        Self { rng: Arc::new(Mutex::new(StdRng::from_entropy())) }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))) }
    }

    pub fn pick(&self, weighted: &[(Address, f64)]) -> Option<Address> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        pick(weighted, &mut *rng)
    }

    pub fn pick_many(&self, weighted: &[(Address, f64)], n: usize) -> Vec<Address> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        pick_many(weighted, n, &mut *rng)
    }
}

/// Available workers that pass the capability filter, with their model caches.
pub async fn load_candidates(
    tx: &mut dyn StoreTx,
    req: &Requirements<'_>,
) -> Result<Vec<Candidate>, RelayError> {
    let workers: Vec<Worker> = tx
        .workers_in_status(WorkerStatus::Available)
        .await?
        .into_iter()
        .filter(|w| is_capable(w, req))
        .collect();
    if workers.is_empty() {
        return Ok(Vec::new());
    }

    let addresses: Vec<Address> = workers.iter().map(|w| w.address).collect();
    let mut caches: BTreeMap<Address, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
    for entry in tx.model_entries(&addresses).await? {
        let (cached, in_use) = caches.entry(entry.worker).or_default();
        if entry.in_use {
            in_use.insert(entry.model_id.clone());
        }
        cached.insert(entry.model_id);
    }

    Ok(workers
        .into_iter()
        .map(|worker| {
            let (cached, in_use) = caches.remove(&worker.address).unwrap_or_default();
            Candidate { worker, cached, in_use }
        })
        .collect())
}

/// Weights for dispatching a job.
pub fn dispatch_weights(
    candidates: &[Candidate],
    required: &[String],
    top_reward: u64,
    stakes: &StakeNormalizer,
) -> Vec<(Address, f64)> {
    candidates
        .iter()
        .map(|c| {
            let factor = stakes.factor(c.worker.stake);
            (c.worker.address, weight(c, required, top_reward, factor, true))
        })
        .collect()
}

/// Weights for pre-fetching `model_id`: only workers lacking it, no locality
/// bonus, never `exclude`.
pub fn prefetch_weights(
    candidates: &[Candidate],
    model_id: &str,
    exclude: Option<&Address>,
    top_reward: u64,
    stakes: &StakeNormalizer,
) -> Vec<(Address, f64)> {
    candidates
        .iter()
        .filter(|c| !c.cached.contains(model_id))
        .filter(|c| Some(&c.worker.address) != exclude)
        .map(|c| {
            let factor = stakes.factor(c.worker.stake);
            (c.worker.address, weight(c, &[], top_reward, factor, false))
        })
        .collect()
}

impl Relay {
    /// Draw a worker for `job`. `None` is the ordinary "nobody free" outcome.
    pub async fn select_worker(&self, job: &Job) -> Result<Option<Address>, RelayError> {
        let mut tx = self.store.begin().await?;
        let candidates = load_candidates(tx.as_mut(), &Requirements::from(job)).await?;
        tx.rollback().await?;
        let weighted =
            dispatch_weights(&candidates, &job.model_ids, self.config.qos.top_reward(), &self.stakes);
        Ok(self.sampler.pick(&weighted))
    }

    /// Up to `n` capable workers lacking `model_id`, never the job's own worker.
    pub async fn select_prefetch_workers(
        &self,
        job: &Job,
        model_id: &str,
        n: usize,
    ) -> Result<Vec<Address>, RelayError> {
        let mut tx = self.store.begin().await?;
        let candidates = load_candidates(tx.as_mut(), &Requirements::from(job)).await?;
        tx.rollback().await?;
        let weighted = prefetch_weights(
            &candidates,
            model_id,
            job.worker.as_ref(),
            self.config.qos.top_reward(),
            &self.stakes,
        );
        Ok(self.sampler.pick_many(&weighted, n))
    }
}
