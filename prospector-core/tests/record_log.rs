use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use prospector_core::ProspectorError;
use prospector_core::context::{CampaignContext, DataPaths};
use prospector_core::records::{CompactionLock, Record, RecordLog, RecordLogConfig};
use prospector_core::storage::{LocalStore, MemoryStore, ObjectStore};
use uuid::Uuid;

fn log_over(store: Arc<dyn ObjectStore>, worker: &str) -> RecordLog {
    let ctx = CampaignContext::new("roadside", DataPaths::default(), store, worker);
    RecordLog::new(ctx, RecordLogConfig::default())
}

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, 9, 0, 0).unwrap()
}

fn listing(place_id: &str, name: &str, day: u32) -> Record {
    Record::observed(Some(place_id.to_string()), at(day))
        .with_name(name)
        .with_address("100 Congress Ave, Austin, TX")
        .with_keyword("tow trucks")
}

#[tokio::test]
async fn compaction_keeps_one_entry_per_place() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let a = log_over(store.clone(), "worker-a");
    let b = log_over(store.clone(), "worker-b");

    a.append(&listing("ChIJ-one", "Lone Star Towing", 1)).await.expect("append");
    b.append(&listing("ChIJ-one", "Lone Star Towing LLC", 2)).await.expect("append");
    a.append_batch(&[
        listing("ChIJ-two", "Capital Wreckers", 1),
        listing("ChIJ-three", "Hill Country Tow", 1),
    ])
    .await
    .expect("append batch");

    let before = a.read_all().await.expect("read");
    assert_eq!(before.len(), 3);
    assert!(before.wal_files >= 3);

    let report = a.compact().await.expect("compact");
    assert_eq!(report.checkpoint_records, 3);
    assert_eq!(report.wal_files_merged, report.wal_files_purged);
    assert!(report.checkpoint_rewritten);
    assert!(report.retained_files.is_empty());
    assert!(a.pending_shards().await.expect("shards").is_empty());

    let after = b.read_all().await.expect("read");
    assert_eq!(after.len(), 3);
    assert_eq!(after.wal_files, 0);
    assert_eq!(after.checkpoint_entries, 3);
    let newest = after.get("ChIJ-one").expect("merged record");
    assert_eq!(newest.name.as_deref(), Some("Lone Star Towing LLC"));
}

#[tokio::test]
async fn second_compaction_is_a_no_op() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let log = log_over(store.clone(), "worker-a");
    log.append(&listing("ChIJ-one", "Lone Star Towing", 1)).await.expect("append");
    log.compact().await.expect("first compaction");

    let checkpoint_key = log.context().paths().records_checkpoint();
    let first = store.get(&checkpoint_key).await.expect("get").expect("checkpoint");

    let report = log.compact().await.expect("second compaction");
    assert!(!report.checkpoint_rewritten);
    assert_eq!(report.wal_files_merged, 0);
    assert_eq!(report.checkpoint_records, 1);

    let second = store.get(&checkpoint_key).await.expect("get").expect("checkpoint");
    assert_eq!(first, second);
}

#[tokio::test]
async fn complete_record_wins_regardless_of_order() {
    let hollow = Record::observed(Some("ChIJ-one".to_string()), at(5)).with_name("Lone Star Towing");
    let complete = listing("ChIJ-one", "Lone Star Towing", 1);

    for order in [[&hollow, &complete], [&complete, &hollow]] {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let log = log_over(store, "worker-a");
        for record in order {
            log.append(record).await.expect("append");
        }
        log.compact().await.expect("compact");

        let merged = log.get("ChIJ-one").await.expect("read").expect("merged record");
        assert_eq!(merged.address.as_deref(), Some("100 Congress Ave, Austin, TX"));
        assert!(!merged.is_hollow());
    }
}

#[tokio::test]
async fn records_without_place_id_dedupe_on_content() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let log = log_over(store, "worker-a");
    let first = Record::observed(None, at(1))
        .with_name("Lone Star  Towing")
        .with_address("100 Congress Ave");
    let second = Record::observed(None, at(2))
        .with_name("lone star towing")
        .with_address("100 CONGRESS AVE")
        .with_domain("lonestartow.example");
    log.append(&first).await.expect("append");
    log.append(&second).await.expect("append");

    let snapshot = log.read_all().await.expect("read");
    assert_eq!(snapshot.len(), 1);
    let key = first.key().to_string();
    assert!(key.starts_with("hash:"));
    let merged = snapshot.get(&key).expect("merged record");
    assert_eq!(merged.domain.as_deref(), Some("lonestartow.example"));
}

#[tokio::test]
async fn corrupt_wal_files_are_retained() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let log = log_over(store.clone(), "worker-a");
    log.append(&listing("ChIJ-one", "Lone Star Towing", 1)).await.expect("append");

    let paths = log.context().paths();
    let bad_key = format!("{}/broken.usv", paths.records_wal_shard('x'));
    store
        .put(&bad_key, b"this is not a record\n".to_vec())
        .await
        .expect("put");

    let report = log.compact().await.expect("compact");
    assert_eq!(report.corrupt_entries, 1);
    assert_eq!(report.retained_files, vec![bad_key.clone()]);
    assert_eq!(report.checkpoint_records, 1);
    assert!(store.exists(&bad_key).await.expect("exists"));

    let snapshot = log.read_all().await.expect("read");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.corrupt_entries, 1);
}

#[tokio::test]
async fn live_compaction_lock_blocks_a_second_compactor() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let log = log_over(store.clone(), "worker-a");
    log.append(&listing("ChIJ-one", "Lone Star Towing", 1)).await.expect("append");

    let now = Utc::now();
    let held = CompactionLock {
        token: Uuid::now_v7(),
        owner: "worker-b".to_string(),
        acquired_at: now,
        expires_at: now + Duration::minutes(10),
    };
    let lock_key = log.context().paths().compaction_lock();
    store
        .put(&lock_key, serde_json::to_vec(&held).expect("json"))
        .await
        .expect("put");

    match log.compact().await {
        Err(ProspectorError::CompactionLocked { owner, .. }) => assert_eq!(owner, "worker-b"),
        other => panic!("expected CompactionLocked, got {other:?}"),
    }
    assert!(store.exists(&lock_key).await.expect("exists"));
}

#[tokio::test]
async fn abandoned_compaction_lock_is_taken_over() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let log = log_over(store.clone(), "worker-a");
    log.append(&listing("ChIJ-one", "Lone Star Towing", 1)).await.expect("append");

    let long_ago = Utc::now() - Duration::hours(2);
    let stale = CompactionLock {
        token: Uuid::now_v7(),
        owner: "worker-b".to_string(),
        acquired_at: long_ago,
        expires_at: long_ago + Duration::minutes(10),
    };
    let lock_key = log.context().paths().compaction_lock();
    store
        .put(&lock_key, serde_json::to_vec(&stale).expect("json"))
        .await
        .expect("put");

    let report = log.compact().await.expect("compact");
    assert_eq!(report.checkpoint_records, 1);
    assert!(!store.exists(&lock_key).await.expect("exists"));
}

#[tokio::test]
async fn local_store_compaction_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
    let log = log_over(store, "worker-a");
    log.append(&listing("ChIJ-one", "Lone Star Towing", 1)).await.expect("append");
    log.append(&listing("ChIJ-two", "Capital Wreckers", 1)).await.expect("append");
    log.compact().await.expect("compact");

    let checkpoint = dir
        .path()
        .join("campaigns/roadside/indexes/records/checkpoint.usv");
    let body = std::fs::read_to_string(checkpoint).expect("checkpoint on disk");
    assert_eq!(body.lines().count(), 2);
    assert!(body.ends_with('\n'));

    let snapshot = log.read_all().await.expect("read");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
        snapshot.get("ChIJ-two").and_then(|r| r.keyword.as_deref()),
        Some("tow trucks")
    );
}
