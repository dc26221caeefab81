//! Store-level behavioral tests against the in-memory backend.
//!
//! Run with: cargo test --features test

use millstone::queue::memory::{MemoryQueue, MockClock};
use millstone::{Job, JobId, JobState, JobStore, Worker, worker::BatchHandler};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn concurrent_fetches_never_share_a_job() {
    let store = Arc::new(MemoryQueue::new());
    let total = 100;
    let mut eligible = HashSet::new();
    for n in 0..total {
        let id = store
            .send(Job::new("race", json!({"n": n})))
            .await
            .unwrap()
            .unwrap();
        eligible.insert(id);
    }

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store.fetch("race", 4).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|j| j.id));
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all_claims: Vec<JobId> = Vec::new();
    for handle in handles {
        all_claims.extend(handle.await.unwrap());
    }

    let distinct: HashSet<JobId> = all_claims.iter().copied().collect();
    assert_eq!(
        distinct.len(),
        all_claims.len(),
        "two fetches returned the same job id"
    );
    assert_eq!(distinct, eligible, "claims must cover exactly the eligible set");
}

#[tokio::test]
async fn complete_twice_is_a_no_op() {
    let store = MemoryQueue::new();
    let id = store
        .send(Job::new("q", json!(null)))
        .await
        .unwrap()
        .unwrap();
    store.fetch("q", 1).await.unwrap();

    assert_eq!(store.complete(&[id], None).await.unwrap(), 1);
    assert_eq!(store.complete(&[id], None).await.unwrap(), 0);
}

#[tokio::test]
async fn retry_budget_exhaustion_ends_failed() {
    let clock = MockClock::new();
    let store = MemoryQueue::with_clock(clock.clone());
    let id = store
        .send(
            Job::new("flaky", json!(null))
                .with_retry_limit(2)
                .with_retry_delay(Duration::from_secs(1))
                .with_exponential_backoff(),
        )
        .await
        .unwrap()
        .unwrap();

    let mut schedule = Vec::new();
    for round in 0..3 {
        clock.advance(chrono::Duration::minutes(10));
        let batch = store.fetch("flaky", 1).await.unwrap();
        assert_eq!(batch.len(), 1, "round {round}: job should be claimable");
        store.fail(&[id], Some(json!({"attempt": round}))).await.unwrap();
        schedule.push(store.get_job(id).await.unwrap().unwrap().start_after);
    }

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 2);

    // Each retry's start_after strictly increases; the terminal failure
    // leaves the last schedule untouched.
    assert!(schedule[0] < schedule[1]);
    assert_eq!(schedule[1], schedule[2]);
}

#[tokio::test]
async fn expired_job_returns_through_the_sweep() {
    let clock = MockClock::new();
    let store = MemoryQueue::with_clock(clock.clone());
    let id = store
        .send(
            Job::new("slow", json!(null))
                .with_retry_limit(1)
                .with_retry_delay(Duration::from_secs(1))
                .with_expire_in(Duration::from_secs(1)),
        )
        .await
        .unwrap()
        .unwrap();

    store.fetch("slow", 1).await.unwrap();
    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(store.expire().await.unwrap(), 1);
    assert_eq!(
        store.get_job(id).await.unwrap().unwrap().state,
        JobState::Retry,
        "budget remains, so expiry re-queues"
    );
}

#[tokio::test]
async fn archive_then_purge_round_trip() {
    let clock = MockClock::new();
    let store = MemoryQueue::with_clock(clock.clone());
    let id = store
        .send(Job::new("reports", json!({"week": 32})))
        .await
        .unwrap()
        .unwrap();
    store.fetch("reports", 1).await.unwrap();
    store.complete(&[id], None).await.unwrap();

    assert!(store.get_archived_job(id).await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(1));
    assert_eq!(store.archive(Duration::ZERO).await.unwrap(), 1);
    assert!(store.get_job(id).await.unwrap().is_none());
    let archived = store.get_archived_job(id).await.unwrap().unwrap();
    assert_eq!(archived.job.id, id);
    assert_eq!(archived.job.payload, json!({"week": 32}));

    clock.advance(chrono::Duration::seconds(1));
    assert_eq!(store.purge(Duration::ZERO).await.unwrap(), 1);
    assert!(store.get_archived_job(id).await.unwrap().is_none());
}

#[tokio::test]
async fn state_snapshot_shapes() {
    let store = MemoryQueue::new();

    let empty = store.count_states().await.unwrap();
    assert_eq!(empty.counts.all, 0);
    assert_eq!(empty.counts.created, 0);
    assert!(empty.queues.is_empty());

    store.send(Job::new("Q", json!(null))).await.unwrap();
    let snapshot = store.count_states().await.unwrap();
    assert_eq!(snapshot.counts.created, 1);
    assert_eq!(snapshot.counts.all, 1);
    assert_eq!(snapshot.queues["Q"].created, 1);
    assert_eq!(snapshot.queues["Q"].all, 1);
    assert_eq!(snapshot.queues.len(), 1);
}

#[tokio::test]
async fn dedup_send_is_suppressed_not_failed() {
    let store = MemoryQueue::new();
    let window = Duration::from_secs(600);

    let first = store
        .send(Job::new("mail", json!(null)).with_singleton_key("daily").with_singleton_window(window))
        .await
        .unwrap();
    assert!(first.is_some());

    // The duplicate resolves Ok with no id; it is a contract, not an error.
    let duplicate = store
        .send(Job::new("mail", json!(null)).with_singleton_key("daily").with_singleton_window(window))
        .await
        .unwrap();
    assert!(duplicate.is_none());
}

#[tokio::test]
async fn worker_drains_queue_end_to_end() {
    let store = Arc::new(MemoryQueue::new());
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            store
                .send(Job::new("jobs", json!({"n": n})))
                .await
                .unwrap()
                .unwrap(),
        );
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let handler: BatchHandler = Arc::new(move |jobs| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(jobs.len(), Ordering::SeqCst);
            Ok(())
        })
    });

    let worker = Worker::new(store.clone(), "jobs", handler)
        .with_batch_size(2)
        .with_poll_interval(Duration::from_millis(10));
    let handle = worker.spawn();

    for _ in 0..200 {
        if seen.load(Ordering::SeqCst) == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    for id in ids {
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}
