//! Solo job lifecycle: create → start → report → validate → settle, plus the
//! abort and deadline paths.

mod common;

use std::time::Duration;

use relay_core::{AbortReason, Amount, EventKind, JobStatus, TaskError, WorkerStatus};
use relay_engine::deadline;
use relay_engine::{RelayError, Shutdown, StatsRollup};

use common::*;

#[tokio::test]
async fn solo_job_pays_the_worker() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &["sdxl"]).await;

    let seed = seed_for(&h.creator_key, false);
    let created = h.relay.create_job(new_job(h.creator, 400, seed)).await.unwrap();
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(600u64));
    assert_eq!(
        h.relay.balance(&relay_account()).await.unwrap(),
        Amount::from(400u64 + STAKE)
    );

    let started = h.relay.start_job(created.commitment, worker).await.unwrap();
    assert_eq!(started.status, JobStatus::Started);
    let busy = h.relay.worker(&worker).await.unwrap();
    assert_eq!(busy.status, WorkerStatus::Busy);
    assert_eq!(busy.current_job, Some(created.commitment));

    let intruder = worker_address(0x09);
    let err = h
        .relay
        .report_score(created.commitment, intruder, vec![1, 2, 3])
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized { .. }));

    h.relay
        .report_score(created.commitment, worker, vec![0xAB; 8])
        .await
        .unwrap();
    let validated = h
        .relay
        .validate_single(reveal(&h.creator_key, &created))
        .await
        .unwrap();
    assert_eq!(validated.status, JobStatus::Validated);
    assert_eq!(validated.qos_reward, Some(10));
    assert_eq!(validated.task_id, Some(created.task_id));

    let settled = h.relay.finish_job(created.commitment).await.unwrap();
    assert_eq!(settled.status, JobStatus::EndSuccess);
    assert_eq!(h.relay.balance(&worker).await.unwrap(), Amount::from(400u64));

    let idle = h.relay.worker(&worker).await.unwrap();
    assert_eq!(idle.status, WorkerStatus::Available);
    assert_eq!(idle.current_job, None);
    assert_eq!(idle.qos_score, Some(10.0));

    let kinds: Vec<EventKind> = h
        .relay
        .events_after(0, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    for kind in [
        EventKind::TaskCreated,
        EventKind::TaskStarted,
        EventKind::TaskScoreReady,
        EventKind::TaskValidated,
        EventKind::TaskPayment,
        EventKind::TaskEndSuccess,
    ] {
        assert!(kinds.contains(&kind), "missing {kind}");
    }

    // deposits are the only source of funds
    assert_eq!(h.store.total_balance().await, Amount::from(1_000u64 + STAKE));

    let stats = StatsRollup::new();
    let snapshot = stats.rollup(&h.store).await.unwrap();
    assert_eq!(snapshot.total_fees_paid, Amount::from(400u64));
    assert_eq!(snapshot.incentives.get(&worker), Some(&Amount::from(400u64)));
    assert_eq!(snapshot.jobs_by_status.get("EndSuccess"), Some(&1));
    assert_eq!(snapshot.worker_qos.get(&worker), Some(&10.0));
    assert_eq!(stats.snapshot().await, snapshot);

    // a second pass does not count the same payment twice
    let again = stats.rollup(&h.store).await.unwrap();
    assert_eq!(again.total_fees_paid, Amount::from(400u64));
}

#[tokio::test]
async fn group_sampled_job_cannot_validate_alone() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;

    let seed = seed_for(&h.creator_key, true);
    let created = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(created.commitment, worker).await.unwrap();
    h.relay.report_score(created.commitment, worker, vec![1]).await.unwrap();

    let err = h
        .relay
        .validate_single(reveal(&h.creator_key, &created))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::SamplingMismatch(_)));
    assert_eq!(
        h.relay.job(&created.commitment).await.unwrap().status,
        JobStatus::ScoreReady
    );
}

#[tokio::test]
async fn reported_error_is_refunded_after_validation() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;

    let seed = seed_for(&h.creator_key, false);
    let created = h.relay.create_job(new_job(h.creator, 250, seed)).await.unwrap();
    h.relay.start_job(created.commitment, worker).await.unwrap();
    h.relay
        .report_error(created.commitment, worker, TaskError::ParametersValidationFailed)
        .await
        .unwrap();

    let job = h
        .relay
        .validate_single(reveal(&h.creator_key, &created))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::EndAborted);
    assert_eq!(job.abort_reason, Some(AbortReason::IncorrectResult));
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(1_000u64));
    assert_eq!(h.relay.worker(&worker).await.unwrap().status, WorkerStatus::Available);
}

#[tokio::test]
async fn abort_rights_depend_on_issuer_and_status() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    // creator may cancel while queued
    let queued = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    let aborted = h
        .relay
        .abort_job(queued.commitment, h.creator, AbortReason::IssuerCancelled)
        .await
        .unwrap();
    assert_eq!(aborted.status, JobStatus::EndAborted);
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(1_000u64));

    // but not once a worker has it, before the deadline
    let running = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(running.commitment, worker).await.unwrap();
    let err = h
        .relay
        .abort_job(running.commitment, h.creator, AbortReason::IssuerCancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized { .. }));

    // the assigned worker may give up
    let given_up = h
        .relay
        .abort_job(running.commitment, worker, AbortReason::ModelDownloadFailed)
        .await
        .unwrap();
    assert_eq!(given_up.abort_reason, Some(AbortReason::ModelDownloadFailed));
    assert_eq!(given_up.qos_reward, Some(0));
    assert_eq!(h.relay.worker(&worker).await.unwrap().status, WorkerStatus::Available);

    // terminal jobs stay terminal
    let err = h
        .relay
        .abort_job(running.commitment, relay_account(), AbortReason::Timeout)
        .await
        .unwrap_err();
    assert!(err.is_precondition_failure());
}

#[tokio::test]
async fn sweep_times_out_expired_jobs() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    let mut request = new_job(h.creator, 100, seed);
    request.timeout_secs = Some(0);
    let expired = h.relay.create_job(request).await.unwrap();
    h.relay.start_job(expired.commitment, worker).await.unwrap();
    let fresh = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();

    assert_eq!(h.relay.sweep_expired().await.unwrap(), 1);
    let job = h.relay.job(&expired.commitment).await.unwrap();
    assert_eq!(job.status, JobStatus::EndAborted);
    assert_eq!(job.abort_reason, Some(AbortReason::Timeout));
    assert_eq!(h.relay.worker(&worker).await.unwrap().status, WorkerStatus::Available);
    assert_eq!(
        h.relay.job(&fresh.commitment).await.unwrap().status,
        JobStatus::Queued
    );
    assert_eq!(h.relay.sweep_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn watcher_aborts_at_the_deadline() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    let mut request = new_job(h.creator, 100, seed);
    request.timeout_secs = Some(1);
    let created = h.relay.create_job(request).await.unwrap();
    h.relay.start_job(created.commitment, worker).await.unwrap();

    let watcher = deadline::spawn_watcher(h.relay.clone(), created.commitment, Shutdown::new());
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .unwrap()
        .unwrap();
    let job = h.relay.job(&created.commitment).await.unwrap();
    assert_eq!(job.status, JobStatus::EndAborted);
    assert_eq!(job.abort_reason, Some(AbortReason::Timeout));
}

#[tokio::test]
async fn watcher_leaves_finished_jobs_alone() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    let created = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(created.commitment, worker).await.unwrap();
    h.relay.report_score(created.commitment, worker, vec![7]).await.unwrap();
    h.relay
        .validate_single(reveal(&h.creator_key, &created))
        .await
        .unwrap();
    h.relay.finish_job(created.commitment).await.unwrap();

    let watcher = deadline::spawn_watcher(h.relay.clone(), created.commitment, Shutdown::new());
    tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        h.relay.job(&created.commitment).await.unwrap().status,
        JobStatus::EndSuccess
    );
}

#[tokio::test]
async fn unsettled_validation_releases_the_worker_at_the_deadline() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    let mut request = new_job(h.creator, 100, seed);
    request.timeout_secs = Some(1);
    let created = h.relay.create_job(request).await.unwrap();
    h.relay.start_job(created.commitment, worker).await.unwrap();
    h.relay.report_score(created.commitment, worker, vec![7]).await.unwrap();
    h.relay
        .validate_single(reveal(&h.creator_key, &created))
        .await
        .unwrap();
    assert_eq!(h.relay.sweep_expired().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(h.relay.sweep_expired().await.unwrap(), 1);

    let job = h.relay.job(&created.commitment).await.unwrap();
    assert_eq!(job.status, JobStatus::EndAborted);
    assert_eq!(job.abort_reason, Some(AbortReason::Timeout));
    let released = h.relay.worker(&worker).await.unwrap();
    assert_eq!(released.status, WorkerStatus::Available);
    assert!(released.current_job.is_none());
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(1_000u64));

    // a late settlement finds nothing to pay
    assert!(h.relay.finish_job(created.commitment).await.unwrap_err().is_precondition_failure());
}

#[tokio::test]
async fn out_of_range_timeouts_are_rejected() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let seed = seed_for(&h.creator_key, false);

    for timeout in [1_000_000_000_000_000, u64::MAX] {
        let mut request = new_job(h.creator, 100, seed);
        request.timeout_secs = Some(timeout);
        let err = h.relay.create_job(request).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(1_000u64));

    let mut request = new_job(h.creator, 100, seed);
    request.timeout_secs = Some(h.relay.config().timeouts.max_job_timeout_secs);
    let created = h.relay.create_job(request).await.unwrap();
    assert_eq!(h.relay.sweep_expired().await.unwrap(), 0);
    assert_eq!(
        h.relay.job(&created.commitment).await.unwrap().status,
        JobStatus::Queued
    );
}

#[tokio::test]
async fn low_rewards_kick_the_worker_out_on_its_next_finish() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    // reward 10
    let paid = h.relay.create_job(new_job(h.creator, 300, seed)).await.unwrap();
    h.relay.start_job(paid.commitment, worker).await.unwrap();
    h.relay.report_score(paid.commitment, worker, vec![1]).await.unwrap();
    h.relay.validate_single(reveal(&h.creator_key, &paid)).await.unwrap();
    h.relay.finish_job(paid.commitment).await.unwrap();

    // reward 0: window [0, 10, 10] sums above the threshold
    let first = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(first.commitment, worker).await.unwrap();
    h.relay
        .abort_job(first.commitment, worker, AbortReason::ModelDownloadFailed)
        .await
        .unwrap();
    let kept = h.relay.worker(&worker).await.unwrap();
    assert_eq!(kept.status, WorkerStatus::Available);
    assert_eq!(kept.qos_score, Some(5.0));

    // reward 0 again: window [0, 0, 10] reaches the threshold
    let second = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(second.commitment, worker).await.unwrap();
    h.relay
        .abort_job(second.commitment, worker, AbortReason::ModelDownloadFailed)
        .await
        .unwrap();

    let evicted = h.relay.worker(&worker).await.unwrap();
    assert_eq!(evicted.status, WorkerStatus::Quit);
    assert_eq!(evicted.stake, Amount::ZERO);
    assert!(evicted.current_job.is_none());
    assert_eq!(h.relay.balance(&worker).await.unwrap(), Amount::from(300 + STAKE));
    assert_eq!(h.relay.balance(&h.creator).await.unwrap(), Amount::from(700u64));
    assert_eq!(h.relay.balance(&relay_account()).await.unwrap(), Amount::ZERO);

    let events = h.relay.events_after(0, 100).await.unwrap();
    let kicked: Vec<_> = events.iter().filter(|e| e.kind == EventKind::WorkerKickedOut).collect();
    assert_eq!(kicked.len(), 1);
    assert_eq!(kicked[0].worker, Some(worker));

    // a quit worker takes no more work
    let third = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    assert!(h.relay.start_job(third.commitment, worker).await.is_err());
}
