//! Shared builders for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;

use relay_core::{
    Address, Amount, GpuInfo, HardwareRequirement, RelayConfig, SamplingSeed, TaskType, B256,
};
use relay_engine::consensus::{commitment, vrf};
use relay_engine::{CreatedJob, JoinRequest, NewJob, Relay, ValidationRequest};
use relay_store::MemoryStore;

pub const RELAY_BYTE: u8 = 0xEE;
pub const STAKE: u64 = 100;

pub fn relay_account() -> Address {
    Address::repeat_byte(RELAY_BYTE)
}

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::defaults();
    config.relay.account = relay_account();
    config.validation.group_ready_timeout_secs = 1;
    config.validation.group_poll_interval_ms = 10;
    config.dispatch.poll_interval_ms = 10;
    config.dispatch.no_worker_backoff_ms = 10;
    config.timeouts.deadline_poll_interval_ms = 20;
    config.chain.poll_interval_ms = 10;
    config.chain.retry_backoff_ms = 10;
    config.chain.confirmation_timeout_secs = 1;
    config
}

pub struct Harness {
    pub relay: Relay,
    pub store: MemoryStore,
    pub creator_key: SecretKey,
    pub creator: Address,
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: RelayConfig) -> Harness {
    let store = MemoryStore::new();
    let relay = Relay::new(Arc::new(store.clone()), config).with_sampler_seed(7);
    let creator_key = SecretKey::from_slice(&[0x11; 32]).unwrap();
    let creator = commitment::public_key_address(&creator_key.public_key());
    Harness { relay, store, creator_key, creator }
}

pub fn worker_address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub async fn fund(relay: &Relay, address: Address, amount: u64) {
    relay.deposit(address, Amount::from(amount), None).await.unwrap();
}

/// Fund the stake and join a 24 GB worker holding `models`.
pub async fn join_worker(relay: &Relay, byte: u8, models: &[&str]) -> Address {
    let address = worker_address(byte);
    fund(relay, address, STAKE).await;
    relay
        .join(JoinRequest {
            address,
            gpu: GpuInfo { name: "RTX 4090".into(), vram: 24 },
            version: "2.1.0".into(),
            stake: Amount::from(STAKE),
            models: models.iter().map(|m| m.to_string()).collect(),
        })
        .await
        .unwrap();
    address
}

pub fn new_job(creator: Address, fee: u64, sampling_seed: SamplingSeed) -> NewJob {
    NewJob {
        creator,
        task_type: TaskType::Image,
        task_args: r#"{"prompt":"a lighthouse"}"#.into(),
        hardware: HardwareRequirement { gpu_name: None, gpu_vram: 16 },
        model_ids: vec!["sdxl".into()],
        min_version: "2.0.0".into(),
        fee: Amount::from(fee),
        task_id: None,
        sampling_seed: Some(sampling_seed),
        timeout_secs: None,
    }
}

fn public_key(secret: &SecretKey) -> Vec<u8> {
    secret.public_key().to_encoded_point(true).as_bytes().to_vec()
}

/// A seed whose VRF output under `secret` selects group validation (`group`)
/// or solo validation (`!group`).
pub fn seed_for(secret: &SecretKey, group: bool) -> SamplingSeed {
    (0u8..=255)
        .map(|b| B256::with_last_byte(b))
        .find(|seed| {
            let proof = vrf::prove(secret, seed.as_slice()).unwrap();
            let beta = vrf::verify(&public_key(secret), seed.as_slice(), &proof).unwrap();
            (vrf::sampling_number(&beta) == 0) == group
        })
        .expect("no seed with the wanted sampling outcome")
}

pub fn reveal(secret: &SecretKey, created: &CreatedJob) -> ValidationRequest {
    ValidationRequest {
        commitment: created.commitment,
        task_id: created.task_id,
        vrf_proof: vrf::prove(secret, created.sampling_seed.as_slice()).unwrap(),
        public_key: public_key(secret),
    }
}
