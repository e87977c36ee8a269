use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use prospector_core::ProspectorError;
use prospector_core::context::{CampaignContext, DataPaths, QueueState};
use prospector_core::queue::{
    DetailsTask, HandlerOutcome, ObjectStoreQueue, QueueConfig, QueueWorker, RetryConfig,
    RetryDisposition, TaskHandler, TaskLease, TaskPayload, TaskQueue, WorkerReport,
};
use prospector_core::storage::{LocalStore, MemoryStore, ObjectStore};
use tokio_util::sync::CancellationToken;

fn no_backoff() -> QueueConfig {
    QueueConfig {
        retry: RetryConfig {
            max_attempts: 2,
            backoff_base_ms: 0,
            ..RetryConfig::default()
        },
        ..QueueConfig::default()
    }
}

fn queue_over(store: Arc<dyn ObjectStore>, worker: &str, config: QueueConfig) -> ObjectStoreQueue {
    let ctx = CampaignContext::new("roadside", DataPaths::default(), store, worker);
    ObjectStoreQueue::new(&ctx, "gm-details", config)
}

fn details(place_id: &str) -> TaskPayload {
    TaskPayload::Details(DetailsTask {
        campaign: "roadside".to_string(),
        place_id: place_id.to_string(),
        name: None,
    })
}

fn backends() -> Vec<(Arc<dyn ObjectStore>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().expect("tempdir");
    let local: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    let memory: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    vec![(local, Some(dir)), (memory, None)]
}

#[tokio::test]
async fn duplicate_pushes_coalesce_and_leases_move_entries() {
    for (store, _dir) in backends() {
        let queue = queue_over(store, "worker-a", no_backoff());

        let a = queue.push(details("a")).await.expect("push a");
        let b = queue.push(details("b")).await.expect("push b");
        let again = queue.push(details("a")).await.expect("push a again");
        assert!(a.accepted());
        assert!(b.accepted());
        assert!(!again.accepted());
        assert_eq!(again.dedup_key(), a.dedup_key());
        assert_eq!(queue.stats().await.expect("stats").pending, 2);

        let leases = queue.poll(2).await.expect("poll");
        assert_eq!(leases.len(), 2);
        let claimed: BTreeSet<&str> = leases.iter().map(|l| l.dedup_key()).collect();
        assert_eq!(claimed, BTreeSet::from([a.dedup_key(), b.dedup_key()]));
        assert!(queue.poll(2).await.expect("poll").is_empty());

        let lease_a = leases
            .iter()
            .find(|l| l.dedup_key() == a.dedup_key())
            .expect("lease for a");
        queue.ack(lease_a).await.expect("ack");

        let stats = queue.stats().await.expect("stats");
        assert_eq!((stats.pending, stats.processing, stats.completed), (0, 1, 1));
        let (state, _) = queue
            .find(a.dedup_key())
            .await
            .expect("find")
            .expect("entry for a");
        assert_eq!(state, QueueState::Completed);

        // Completed work is not enqueued again.
        assert!(!queue.push(details("a")).await.expect("push").accepted());
    }
}

#[tokio::test]
async fn expired_leases_are_reaped_back_to_pending() {
    for (store, _dir) in backends() {
        let queue = queue_over(store, "worker-a", no_backoff());
        let b = queue.push(details("b")).await.expect("push");
        let leases = queue.poll(1).await.expect("poll");
        assert_eq!(leases.len(), 1);

        let now = Utc::now();
        let early = queue.reap_expired_at(now).await.expect("reap");
        assert_eq!(early.total(), 0);

        let later = now + queue.config().lease.lease_ttl() + Duration::seconds(1);
        let report = queue.reap_expired_at(later).await.expect("reap");
        assert_eq!(report.requeued, 1);

        let (state, task) = queue
            .find(b.dedup_key())
            .await
            .expect("find")
            .expect("entry for b");
        assert_eq!(state, QueueState::Pending);
        assert_eq!(task.attempts, 1);
        assert!(task.lease.is_none());
        assert!(task.last_error.as_deref().unwrap_or_default().contains("lease expired"));

        // The original holder lost its lease.
        match queue.ack(&leases[0]).await {
            Err(ProspectorError::LeaseExpired { .. }) => {}
            other => panic!("expected LeaseExpired, got {other:?}"),
        }

        let retry = queue.poll_at(1, later).await.expect("poll");
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempts(), 1);
    }
}

#[tokio::test]
async fn nack_parks_the_task_after_max_attempts() {
    for (store, _dir) in backends() {
        let queue = queue_over(store, "worker-a", no_backoff());
        queue.push(details("c")).await.expect("push");

        let mut dispositions = Vec::new();
        for _ in 0..3 {
            let leases = queue.poll(1).await.expect("poll");
            assert_eq!(leases.len(), 1);
            let disposition = queue
                .nack(&leases[0], Some("listing page timed out".to_string()))
                .await
                .expect("nack");
            dispositions.push(disposition);
        }

        assert!(matches!(dispositions[0], RetryDisposition::Requeued { attempts: 1, .. }));
        assert!(matches!(dispositions[1], RetryDisposition::Requeued { attempts: 2, .. }));
        assert_eq!(dispositions[2], RetryDisposition::Failed { attempts: 3 });

        let stats = queue.stats().await.expect("stats");
        assert_eq!((stats.pending, stats.processing, stats.failed), (0, 0, 1));
        assert!(queue.poll(1).await.expect("poll").is_empty());

        // A failed task stays failed until it is re-driven explicitly.
        let again = queue.push(details("c")).await.expect("push");
        assert!(!again.accepted());
        let stats = queue.stats().await.expect("stats");
        assert_eq!((stats.pending, stats.failed), (0, 1));

        assert!(queue.redrive(again.dedup_key()).await.expect("redrive"));
        assert!(!queue.redrive(again.dedup_key()).await.expect("redrive twice"));
        let stats = queue.stats().await.expect("stats");
        assert_eq!((stats.pending, stats.failed), (1, 0));
        let retry = queue.poll(1).await.expect("poll");
        assert_eq!(retry[0].attempts(), 0);
    }
}

#[tokio::test]
async fn renewed_lease_survives_a_stale_reap() {
    for (store, _dir) in backends() {
        let queue = queue_over(store.clone(), "worker-a", no_backoff());
        let pushed = queue.push(details("g")).await.expect("push");
        let lease = queue.poll(1).await.expect("poll").remove(0);

        let ctx = CampaignContext::new("roadside", DataPaths::default(), store.clone(), "reaper");
        let processing = ctx
            .paths()
            .queue("gm-details")
            .entry(QueueState::Processing, pushed.dedup_key());
        let before = store.get(&processing).await.expect("get").expect("processing entry");
        let renewed = queue.renew(&lease, Duration::minutes(5)).await.expect("renew");

        // A reaper holding the pre-renewal body cannot move the entry.
        assert!(!store
            .delete_if_unchanged(&processing, &before)
            .await
            .expect("conditional delete"));

        let report = queue
            .reap_expired_at(lease.expires_at() + Duration::seconds(1))
            .await
            .expect("reap");
        assert_eq!(report.total(), 0);
        queue.ack(&renewed).await.expect("ack after renew");
        assert_eq!(queue.stats().await.expect("stats").completed, 1);
    }
}

#[tokio::test]
async fn reaping_and_polling_concurrently_keep_one_copy() {
    for (store, _dir) in backends() {
        let producer = queue_over(store.clone(), "producer", no_backoff());
        for id in 0..12 {
            producer.push(details(&format!("lot-{id}"))).await.expect("push");
        }
        // Every lease is already expired when the reapers run.
        let stale = producer.poll(12).await.expect("poll");
        assert_eq!(stale.len(), 12);
        let later = Utc::now() + producer.config().lease.lease_ttl() + Duration::seconds(1);

        let mut handles = Vec::new();
        for worker in 0..3 {
            let reaper = queue_over(store.clone(), &format!("reaper-{worker}"), no_backoff());
            handles.push(tokio::spawn(async move {
                reaper.reap_expired_at(later).await.expect("reap");
                Vec::new()
            }));
            let poller = queue_over(store.clone(), &format!("poller-{worker}"), no_backoff());
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                for _ in 0..4 {
                    for lease in poller.poll_at(4, later).await.expect("poll") {
                        claimed.push(lease);
                    }
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.expect("join"));
        }
        let unique: BTreeSet<String> =
            claimed.iter().map(|lease| lease.dedup_key().to_string()).collect();
        assert_eq!(unique.len(), claimed.len(), "a task was leased twice");

        // Finish the sweep, then every task sits in exactly one state.
        producer.reap_expired_at(later).await.expect("final reap");
        for lease in &claimed {
            producer.ack(lease).await.expect("ack claimed");
        }
        let stats = producer.stats().await.expect("stats");
        assert_eq!(stats.pending + stats.processing + stats.completed + stats.failed, 12);
        assert_eq!(stats.pending + stats.completed, 12);
        for lease in &stale {
            assert!(producer.ack(lease).await.is_err());
        }
    }
}

#[tokio::test]
async fn backoff_delays_redelivery() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let queue = queue_over(store, "worker-a", QueueConfig::default());
    queue.push(details("d")).await.expect("push");

    let leases = queue.poll(1).await.expect("poll");
    let disposition = queue.nack(&leases[0], None).await.expect("nack");
    let RetryDisposition::Requeued { available_at, .. } = disposition else {
        panic!("expected a requeue, got {disposition:?}");
    };
    assert!(available_at > Utc::now());

    assert!(queue.poll(1).await.expect("poll").is_empty());
    let redelivered = queue
        .poll_at(1, available_at + Duration::milliseconds(1))
        .await
        .expect("poll");
    assert_eq!(redelivered.len(), 1);
}

#[tokio::test]
async fn renew_extends_only_the_current_lease() {
    for (store, _dir) in backends() {
        let queue = queue_over(store, "worker-a", no_backoff());
        queue.push(details("e")).await.expect("push");
        let lease = queue.poll(1).await.expect("poll").remove(0);

        let renewed = queue.renew(&lease, Duration::minutes(5)).await.expect("renew");
        assert!(renewed.expires_at() > lease.expires_at());
        assert_eq!(renewed.lease.renewals, 1);
        assert_eq!(renewed.lease.lease_id, lease.lease.lease_id);

        queue.ack(&renewed).await.expect("ack");
        match queue.renew(&lease, Duration::minutes(5)).await {
            Err(ProspectorError::LeaseExpired { .. }) => {}
            other => panic!("expected LeaseExpired, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn dead_letter_skips_remaining_attempts() {
    for (store, _dir) in backends() {
        let queue = queue_over(store, "worker-a", QueueConfig::default());
        let pushed = queue.push(details("f")).await.expect("push");
        let lease = queue.poll(1).await.expect("poll").remove(0);
        queue
            .dead_letter(&lease, Some("listing removed".to_string()))
            .await
            .expect("dead letter");

        let (state, task) = queue
            .find(pushed.dedup_key())
            .await
            .expect("find")
            .expect("entry");
        assert_eq!(state, QueueState::Failed);
        assert_eq!(task.last_error.as_deref(), Some("listing removed"));
    }
}

#[tokio::test]
async fn concurrent_pollers_never_share_a_task() {
    for (store, _dir) in backends() {
        let producer = queue_over(store.clone(), "producer", no_backoff());
        for id in 0..20 {
            producer.push(details(&format!("place-{id}"))).await.expect("push");
        }

        let mut handles = Vec::new();
        for worker in 0..4 {
            let queue = queue_over(store.clone(), &format!("worker-{worker}"), no_backoff());
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let leases = queue.poll(3).await.expect("poll");
                    if leases.is_empty() {
                        break;
                    }
                    for lease in leases {
                        claimed.push(lease.dedup_key().to_string());
                        queue.ack(&lease).await.expect("ack");
                    }
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.expect("join"));
        }
        let unique: BTreeSet<&String> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
        assert_eq!(producer.stats().await.expect("stats").completed, 20);
    }
}

#[tokio::test]
async fn corrupt_pending_entries_are_quarantined() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let queue = queue_over(store.clone(), "worker-a", no_backoff());
    store
        .put(
            "campaigns/roadside/queues/gm-details/pending/garbage.json",
            b"{ not json".to_vec(),
        )
        .await
        .expect("put");

    assert!(queue.poll(5).await.expect("poll").is_empty());
    let stats = queue.stats().await.expect("stats");
    assert_eq!((stats.pending, stats.failed), (0, 1));
}

#[derive(Debug)]
struct ByPlace;

#[async_trait::async_trait]
impl TaskHandler for ByPlace {
    async fn handle(&self, lease: &TaskLease) -> HandlerOutcome {
        let TaskPayload::Details(task) = lease.payload() else {
            return HandlerOutcome::Fail {
                error: "unexpected task kind".to_string(),
            };
        };
        match task.place_id.as_str() {
            "flaky" => HandlerOutcome::Retry {
                error: "details page timed out".to_string(),
            },
            "gone" => HandlerOutcome::Fail {
                error: "listing removed".to_string(),
            },
            _ => HandlerOutcome::Completed,
        }
    }
}

#[tokio::test]
async fn worker_settles_each_outcome() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let mut config = no_backoff();
    config.worker.batch_size = 5;
    let queue = Arc::new(queue_over(store, "worker-a", config.clone()));
    for id in ["ok", "flaky", "gone"] {
        queue.push(details(id)).await.expect("push");
    }

    let worker = QueueWorker::new(
        Arc::clone(&queue),
        Arc::new(ByPlace),
        config,
        CancellationToken::new(),
    );
    let mut report = WorkerReport::default();
    let handled = worker.run_once(&mut report).await.expect("run once");

    assert_eq!(handled, 3);
    assert_eq!(
        report,
        WorkerReport {
            completed: 1,
            retried: 1,
            failed: 1,
            lost_leases: 0,
        }
    );
    let stats = queue.stats().await.expect("stats");
    assert_eq!(
        (stats.pending, stats.processing, stats.completed, stats.failed),
        (1, 0, 1, 1)
    );
}

#[tokio::test]
async fn worker_stops_on_shutdown() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(queue_over(store, "worker-a", no_backoff()));
    queue.push(details("ok")).await.expect("push");

    let shutdown = CancellationToken::new();
    let worker = QueueWorker::new(
        Arc::clone(&queue),
        Arc::new(ByPlace),
        no_backoff(),
        shutdown.clone(),
    );
    let handle = tokio::spawn(async move { worker.run().await });

    for _ in 0..100 {
        if queue.stats().await.expect("stats").completed == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    let report = handle.await.expect("join").expect("worker run");
    assert_eq!(report.completed, 1);
}
