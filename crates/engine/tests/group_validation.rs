//! Redundancy groups of three: ranking, agreement, slashing and the split payout.

mod common;

use std::time::Duration;

use relay_core::{AbortReason, Address, Amount, JobStatus, WorkerStatus};
use relay_engine::{CreatedJob, Relay, RelayError};

use common::*;

const FEE: u64 = 4_100_000_000;

async fn create_group(h: &Harness) -> Vec<CreatedJob> {
    let seed = seed_for(&h.creator_key, true);
    let first = h.relay.create_job(new_job(h.creator, FEE, seed)).await.unwrap();
    let mut group = vec![first.clone()];
    for _ in 0..2 {
        let mut request = new_job(h.creator, FEE, seed);
        request.task_id = Some(first.task_id);
        let created = h.relay.create_job(request).await.unwrap();
        assert_eq!(created.task_id, first.task_id);
        group.push(created);
    }
    group
}

/// Start and report in order, each one slower than the previous.
async fn run(relay: &Relay, created: &CreatedJob, worker: Address, score: Vec<u8>, delay_ms: u64) {
    relay.start_job(created.commitment, worker).await.unwrap();
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    relay.report_score(created.commitment, worker, score).await.unwrap();
}

#[tokio::test]
async fn majority_wins_and_the_fee_is_split_by_rank() {
    let h = harness();
    fund(&h.relay, h.creator, 3 * FEE).await;
    let w1 = join_worker(&h.relay, 0x01, &["sdxl"]).await;
    let w2 = join_worker(&h.relay, 0x02, &["sdxl"]).await;
    let w3 = join_worker(&h.relay, 0x03, &["sdxl"]).await;

    let group = create_group(&h).await;
    run(&h.relay, &group[0], w1, vec![0xAB; 8], 0).await;
    run(&h.relay, &group[1], w2, vec![0xAB; 8], 20).await;
    run(&h.relay, &group[2], w3, vec![0x00; 8], 60).await;

    let requests = group.iter().map(|c| reveal(&h.creator_key, c)).collect();
    let outcome = h.relay.validate_group(requests).await.unwrap();

    let statuses: Vec<JobStatus> = outcome.jobs.iter().map(|j| j.status).collect();
    assert_eq!(
        statuses,
        vec![JobStatus::GroupValidated, JobStatus::EndGroupRefund, JobStatus::EndInvalidated]
    );
    let rewards: Vec<Option<u64>> = outcome.jobs.iter().map(|j| j.qos_reward).collect();
    assert_eq!(rewards, vec![Some(10), Some(9), Some(6)]);
    let canonical = outcome.canonical().unwrap().commitment;
    assert_eq!(canonical, group[0].commitment);

    // the dissenting worker lost its stake
    let slashed = h.relay.worker(&w3).await.unwrap();
    assert_eq!(slashed.status, WorkerStatus::Quit);
    assert_eq!(slashed.stake, Amount::ZERO);
    assert_eq!(h.relay.worker(&w2).await.unwrap().status, WorkerStatus::Available);

    let settled = h.relay.finish_job(canonical).await.unwrap();
    assert_eq!(settled.status, JobStatus::EndGroupSuccess);

    assert_eq!(h.relay.balance(&w1).await.unwrap(), Amount::from(2_157_894_736u64));
    assert_eq!(h.relay.balance(&w2).await.unwrap(), Amount::from(1_942_105_264u64));
    assert_eq!(h.relay.balance(&w3).await.unwrap(), Amount::ZERO);
    // one fee paid, two refunded
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(2 * FEE));
    // two stakes still escrowed, one forfeited
    assert_eq!(
        h.relay.balance(&relay_account()).await.unwrap(),
        Amount::from(3 * STAKE)
    );
    assert_eq!(h.store.total_balance().await, Amount::from(3 * FEE + 3 * STAKE));

    let err = h.relay.finish_job(canonical).await.unwrap_err();
    assert!(err.is_precondition_failure());
}

#[tokio::test]
async fn two_aborted_members_leave_validation_incomplete() {
    let h = harness();
    fund(&h.relay, h.creator, 3 * FEE).await;
    let w1 = join_worker(&h.relay, 0x01, &[]).await;

    let group = create_group(&h).await;
    for created in &group[1..] {
        h.relay
            .abort_job(created.commitment, h.creator, AbortReason::IssuerCancelled)
            .await
            .unwrap();
    }
    run(&h.relay, &group[0], w1, vec![0xAB; 8], 0).await;

    let requests = group.iter().map(|c| reveal(&h.creator_key, c)).collect();
    let outcome = h.relay.validate_group(requests).await.unwrap();
    assert!(outcome.canonical().is_none());

    let survivor = &outcome.jobs[0];
    assert_eq!(survivor.status, JobStatus::EndAborted);
    assert_eq!(survivor.abort_reason, Some(AbortReason::ValidationIncomplete));
    assert_eq!(survivor.qos_reward, Some(10));
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(3 * FEE));
    assert_eq!(h.relay.worker(&w1).await.unwrap().status, WorkerStatus::Available);
}

#[tokio::test]
async fn group_waits_for_running_members() {
    let h = harness();
    fund(&h.relay, h.creator, 3 * FEE).await;
    let w1 = join_worker(&h.relay, 0x01, &[]).await;
    let w2 = join_worker(&h.relay, 0x02, &[]).await;

    let group = create_group(&h).await;
    run(&h.relay, &group[0], w1, vec![0xAB; 8], 0).await;
    h.relay.start_job(group[1].commitment, w2).await.unwrap();

    let requests = group.iter().map(|c| reveal(&h.creator_key, c)).collect();
    let err = h.relay.validate_group(requests).await.unwrap_err();
    assert!(matches!(err, RelayError::GroupNotReady(_)));
    assert_eq!(
        h.relay.job(&group[0].commitment).await.unwrap().status,
        JobStatus::ScoreReady
    );
}

#[tokio::test]
async fn group_request_shape_is_checked() {
    let h = harness();
    fund(&h.relay, h.creator, 3 * FEE).await;
    let group = create_group(&h).await;

    let two = group[..2].iter().map(|c| reveal(&h.creator_key, c)).collect();
    assert!(matches!(
        h.relay.validate_group(two).await,
        Err(RelayError::InvalidRequest(_))
    ));

    let repeated = vec![
        reveal(&h.creator_key, &group[0]),
        reveal(&h.creator_key, &group[0]),
        reveal(&h.creator_key, &group[1]),
    ];
    assert!(matches!(
        h.relay.validate_group(repeated).await,
        Err(RelayError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn solo_sampled_jobs_cannot_form_a_group() {
    let h = harness();
    fund(&h.relay, h.creator, 3 * FEE).await;
    let workers = [
        join_worker(&h.relay, 0x01, &[]).await,
        join_worker(&h.relay, 0x02, &[]).await,
        join_worker(&h.relay, 0x03, &[]).await,
    ];

    let seed = seed_for(&h.creator_key, false);
    let first = h.relay.create_job(new_job(h.creator, FEE, seed)).await.unwrap();
    let mut group = vec![first.clone()];
    for _ in 0..2 {
        let mut request = new_job(h.creator, FEE, seed);
        request.task_id = Some(first.task_id);
        group.push(h.relay.create_job(request).await.unwrap());
    }
    for (created, worker) in group.iter().zip(workers) {
        run(&h.relay, created, worker, vec![1, 2], 0).await;
    }

    let requests = group.iter().map(|c| reveal(&h.creator_key, c)).collect();
    let err = h.relay.validate_group(requests).await.unwrap_err();
    assert!(matches!(err, RelayError::SamplingMismatch(_)));
}

#[tokio::test]
async fn revealed_task_id_cannot_back_a_second_group() {
    let h = harness();
    fund(&h.relay, h.creator, 6 * FEE).await;
    let workers: Vec<Address> = {
        let mut joined = Vec::new();
        for byte in 0x01..=0x04 {
            joined.push(join_worker(&h.relay, byte, &["sdxl"]).await);
        }
        joined
    };

    let first = create_group(&h).await;
    for (i, created) in first.iter().enumerate() {
        run(&h.relay, created, workers[i], vec![0xAB; 8], 20 * i as u64).await;
    }
    let requests = first.iter().map(|c| reveal(&h.creator_key, c)).collect();
    let outcome = h.relay.validate_group(requests).await.unwrap();
    let canonical = outcome.canonical().unwrap().commitment;
    let key = outcome.jobs[0].group_key;
    assert!(key.is_some());
    assert!(outcome.jobs.iter().all(|j| j.group_key == key));

    // a second trio reusing the revealed task id
    let seed = seed_for(&h.creator_key, true);
    let mut second = Vec::new();
    for worker in &workers[1..] {
        let mut request = new_job(h.creator, FEE, seed);
        request.task_id = Some(first[0].task_id);
        let created = h.relay.create_job(request).await.unwrap();
        run(&h.relay, &created, *worker, vec![0xAB; 8], 0).await;
        second.push(created);
    }
    let requests = second.iter().map(|c| reveal(&h.creator_key, c)).collect();
    let err = h.relay.validate_group(requests).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidRequest(_)));
    for created in &second {
        assert_eq!(
            h.relay.job(&created.commitment).await.unwrap().status,
            JobStatus::ScoreReady
        );
    }

    // the split covers the first group only
    h.relay.finish_job(canonical).await.unwrap();
    assert_eq!(h.relay.balance(&workers[0]).await.unwrap(), Amount::from(1_640_000_000u64));
    assert_eq!(h.relay.balance(&workers[1]).await.unwrap(), Amount::from(1_476_000_000u64));
    assert_eq!(h.relay.balance(&workers[2]).await.unwrap(), Amount::from(984_000_000u64));
    assert_eq!(h.relay.balance(&workers[3]).await.unwrap(), Amount::ZERO);
}
