//! Dispatch loops against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use relay_core::{EventKind, JobStatus, WorkerStatus};
use relay_engine::{DispatchOutcome, DispatchQueue, Dispatcher, Shutdown};

use common::*;

#[tokio::test]
async fn dispatch_one_starts_on_a_capable_worker() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &["sdxl"]).await;
    let seed = seed_for(&h.creator_key, false);

    let created = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    match h.relay.dispatch_one(created.commitment).await.unwrap() {
        DispatchOutcome::Started(job) => {
            assert_eq!(job.worker, Some(worker));
            assert_eq!(job.status, JobStatus::Started);
        }
        DispatchOutcome::NoWorker => panic!("worker was free"),
    }
    let models = h.relay.worker_models(&worker).await.unwrap();
    assert!(models.iter().any(|m| m.model_id == "sdxl" && m.in_use));
}

#[tokio::test]
async fn start_asks_workers_lacking_the_model_to_download_it() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let assigned = join_worker(&h.relay, 0x01, &["sdxl"]).await;
    let holder = join_worker(&h.relay, 0x04, &["sdxl"]).await;
    let bare = [
        join_worker(&h.relay, 0x02, &[]).await,
        join_worker(&h.relay, 0x03, &[]).await,
    ];
    let seed = seed_for(&h.creator_key, false);

    let created = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(created.commitment, assigned).await.unwrap();

    let mut asked: Vec<_> = h
        .relay
        .events_after(0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::DownloadModel)
        .inspect(|e| {
            assert_eq!(e.commitment, Some(created.commitment));
            assert_eq!(e.payload["model_id"], "sdxl");
        })
        .filter_map(|e| e.worker)
        .collect();
    asked.sort();
    // one Available holder plus two downloads meets the default target of 3
    assert_eq!(asked, bare.to_vec());
    assert!(!asked.contains(&holder));
}

#[tokio::test]
async fn oversized_job_finds_no_worker() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);

    let mut request = new_job(h.creator, 100, seed);
    request.hardware.gpu_vram = 80;
    let created = h.relay.create_job(request).await.unwrap();
    assert_eq!(
        h.relay.dispatch_one(created.commitment).await.unwrap(),
        DispatchOutcome::NoWorker
    );
    assert_eq!(
        h.relay.job(&created.commitment).await.unwrap().status,
        JobStatus::Queued
    );
}

#[tokio::test]
async fn fill_once_pages_queued_jobs() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let seed = seed_for(&h.creator_key, false);
    for fee in [10, 30, 20] {
        h.relay.create_job(new_job(h.creator, fee, seed)).await.unwrap();
    }

    let queue = Arc::new(DispatchQueue::new(16));
    let dispatcher = Dispatcher::new(h.relay.clone(), queue.clone(), Shutdown::new());
    let mut cursor = 0;
    assert_eq!(dispatcher.fill_once(&mut cursor).await.unwrap(), 3);
    assert_eq!(queue.len(), 3);
    // past the last page the cursor wraps around
    assert_eq!(dispatcher.fill_once(&mut cursor).await.unwrap(), 0);
    assert_eq!(cursor, 0);
    // already queued entries are not duplicated
    dispatcher.fill_once(&mut cursor).await.unwrap();
    assert_eq!(queue.len(), 3);

    let first = queue.pop().await.unwrap();
    assert_eq!(first.fee, relay_core::Amount::from(30u64));
}

#[tokio::test]
async fn loops_drain_the_queue_and_stop_on_shutdown() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let workers = [
        join_worker(&h.relay, 0x01, &["sdxl"]).await,
        join_worker(&h.relay, 0x02, &[]).await,
        join_worker(&h.relay, 0x03, &[]).await,
    ];
    let seed = seed_for(&h.creator_key, false);
    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap());
    }

    let shutdown = Shutdown::new();
    let queue = Arc::new(DispatchQueue::new(16));
    let dispatcher = Dispatcher::new(h.relay.clone(), queue.clone(), shutdown.clone());
    let producer = tokio::spawn(dispatcher.clone().run_producer());
    let consumer = tokio::spawn(dispatcher.run_consumer());

    let all_started = async {
        loop {
            let mut started = 0;
            for created in &jobs {
                if h.relay.job(&created.commitment).await.unwrap().status == JobStatus::Started {
                    started += 1;
                }
            }
            if started == jobs.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), all_started).await.unwrap();

    for worker in workers {
        assert_eq!(h.relay.worker(&worker).await.unwrap().status, WorkerStatus::Busy);
    }

    shutdown.trigger();
    queue.close();
    tokio::time::timeout(Duration::from_secs(2), async {
        producer.await.unwrap();
        consumer.await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn job_waits_until_a_worker_frees_up() {
    let h = harness();
    fund(&h.relay, h.creator, 1_000).await;
    let worker = join_worker(&h.relay, 0x01, &[]).await;
    let seed = seed_for(&h.creator_key, false);
    let first = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();
    h.relay.start_job(first.commitment, worker).await.unwrap();
    let second = h.relay.create_job(new_job(h.creator, 100, seed)).await.unwrap();

    let shutdown = Shutdown::new();
    let queue = Arc::new(DispatchQueue::new(16));
    let dispatcher = Dispatcher::new(h.relay.clone(), queue.clone(), shutdown.clone());
    let producer = tokio::spawn(dispatcher.clone().run_producer());
    let consumer = tokio::spawn(dispatcher.run_consumer());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.relay.job(&second.commitment).await.unwrap().status, JobStatus::Queued);

    h.relay.report_score(first.commitment, worker, vec![1]).await.unwrap();
    h.relay
        .validate_single(reveal(&h.creator_key, &first))
        .await
        .unwrap();
    h.relay.finish_job(first.commitment).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.relay.job(&second.commitment).await.unwrap().status != JobStatus::Started {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.trigger();
    queue.close();
    let _ = tokio::join!(producer, consumer);
}
