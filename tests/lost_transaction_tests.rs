//! Integration tests for lost-transaction cleanup
//!
//! Covers the multi-client coordination protocol: shard ownership is exact
//! and self-healing, expired peers are evicted from the client record, and an
//! attempt abandoned by a dead process is found and rolled back by the scan.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use keystone::atr::{atr_id_for_key, AtrRepository};
use keystone::cleanup::PerBucketCleaner;
use keystone::clientrecord::{ClientRecordRepository, CLIENT_RECORD_DOC_ID};
use keystone::store::{
    Collection, MemoryCluster, MutateOptions, MutateSpec, StoreSemantics,
};
use keystone::{CleanupConfig, Cleaner, Cluster, Durability, TransactionConfig, Transactions};

const NUM_ATRS: u32 = 16;

fn test_config(expiration: Duration) -> TransactionConfig {
    TransactionConfig {
        expiration_time: expiration,
        durability: Durability::None,
        cleanup: CleanupConfig {
            num_atrs: NUM_ATRS,
            cleanup_lost_attempts: false,
            cleanup_client_attempts: false,
            ..CleanupConfig::default()
        },
    }
}

fn per_bucket_cleaner(
    cluster: &Arc<MemoryCluster>,
    client_uuid: &str,
    window: Duration,
) -> Arc<PerBucketCleaner> {
    let collection = cluster.collection("app").expect("bucket exists");
    let cleaner = Arc::new(Cleaner::new(cluster.clone()));
    Arc::new(PerBucketCleaner::new(
        client_uuid.to_string(),
        collection,
        cleaner,
        window,
        NUM_ATRS,
    ))
}

#[tokio::test]
async fn test_lost_attempt_is_found_and_rolled_back() {
    let cluster = Arc::new(MemoryCluster::new());
    let coll = cluster.add_bucket("app");

    // Attempt A stages an insert of "p01" and crashes before committing.
    let engine = Transactions::start(cluster.clone(), test_config(Duration::from_millis(50))).await;
    let mut ctx = engine.attempt();
    ctx.insert("app", "p01", json!({"amount": 7})).await.unwrap();
    let attempt_id = ctx.attempt_id().to_string();
    drop(ctx);
    engine.shutdown().await;

    let atr_id = atr_id_for_key("p01", NUM_ATRS);
    let repo = AtrRepository::new(cluster.collection("app").unwrap());
    assert!(repo.read_entry(&atr_id, &attempt_id).await.unwrap().is_some());

    // A scanning client must converge it after expiry plus a scan interval.
    let scanner = per_bucket_cleaner(&cluster, "scanner-1", Duration::from_millis(200));
    Arc::clone(&scanner).start().await;

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut converged = false;
    while Instant::now() < deadline {
        let doc_gone = coll.get("p01").await.is_err();
        let row_gone = repo.read_entry(&atr_id, &attempt_id).await.unwrap().is_none();
        if doc_gone && row_gone {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    scanner.stop().await;

    assert!(converged, "lost attempt was never cleaned up by the scanner");
    assert!(scanner.run_count() > 0);
}

#[tokio::test]
async fn test_two_clients_partition_the_shard_space() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.add_bucket("app");

    let window = Duration::from_secs(60);
    let c1 = per_bucket_cleaner(&cluster, "client-a", window);
    let c2 = per_bucket_cleaner(&cluster, "client-b", window);

    // Bootstrap: both heartbeat so each sees the other.
    c1.process_client(false).await.unwrap();
    c2.process_client(false).await.unwrap();

    let d1 = c1.process_client(false).await.unwrap();
    let d2 = c2.process_client(false).await.unwrap();

    assert_eq!(d1.active_client_ids, vec!["client-a", "client-b"]);
    assert_eq!(d2.active_client_ids, vec!["client-a", "client-b"]);

    let s1: HashSet<u32> = d1.atr_indexes.iter().copied().collect();
    let s2: HashSet<u32> = d2.atr_indexes.iter().copied().collect();

    // Disjoint, and together they cover 0..NUM_ATRS exactly.
    assert!(s1.is_disjoint(&s2));
    let union: HashSet<u32> = s1.union(&s2).copied().collect();
    assert_eq!(union, (0..NUM_ATRS).collect::<HashSet<u32>>());

    // One client leaves; the survivor's next cycle owns everything.
    c1.stop().await;
    let d2 = c2.process_client(false).await.unwrap();
    assert_eq!(d2.active_client_ids, vec!["client-b"]);
    assert_eq!(d2.atr_indexes.len(), NUM_ATRS as usize);

    c2.stop().await;
}

#[tokio::test]
async fn test_expired_peer_is_evicted_from_client_record() {
    let cluster = Arc::new(MemoryCluster::new());
    let coll = cluster.add_bucket("app");

    // Craft a peer whose heartbeat is ancient and whose own expiry budget is
    // tiny, so the shared logical clock is far past its deadline.
    coll.mutate_in(
        CLIENT_RECORD_DOC_ID,
        vec![MutateSpec::Upsert {
            path: "records.clients.dead-client".to_string(),
            value: json!({"hb": 1, "exp": 10, "atrs": NUM_ATRS}),
        }],
        MutateOptions::default().semantics(StoreSemantics::Upsert),
    )
    .await
    .unwrap();

    let live = per_bucket_cleaner(&cluster, "live-client", Duration::from_secs(60));
    let details = live.process_client(false).await.unwrap();

    assert_eq!(details.expired_client_ids, vec!["dead-client"]);
    assert_eq!(details.active_client_ids, vec!["live-client"]);

    // The heartbeat update pruned the expired entry from the record.
    let repo = ClientRecordRepository::new(cluster.collection("app").unwrap());
    let (record, _, _) = repo.get().await.unwrap().unwrap();
    assert!(!record.clients.contains_key("dead-client"));
    assert!(record.clients.contains_key("live-client"));

    live.stop().await;
}

#[tokio::test]
async fn test_fresh_heartbeat_is_not_evicted() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.add_bucket("app");

    let peer = per_bucket_cleaner(&cluster, "peer", Duration::from_secs(60));
    peer.process_client(false).await.unwrap();

    let live = per_bucket_cleaner(&cluster, "live", Duration::from_secs(60));
    let details = live.process_client(false).await.unwrap();

    assert!(details.expired_client_ids.is_empty());
    assert_eq!(details.active_client_ids, vec!["live", "peer"]);
}

#[tokio::test]
async fn test_scanner_prunes_long_terminal_rows() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.add_bucket("app");

    // A COMPLETED row whose expiry passed long before the cleanup window.
    let repo = AtrRepository::new(cluster.collection("app").unwrap());
    let entry = keystone::atr::AtrEntry {
        transaction_id: "t-old".into(),
        state: keystone::AttemptState::Completed,
        timestamp_start_ms: 1,
        expires_after_ms: 1,
        durability: Durability::None,
        inserted_ids: vec![],
        replaced_ids: vec![],
        removed_ids: vec![],
        forward_compat: None,
    };
    repo.write_entry("_txn:atr-0", "old-attempt", &entry, Durability::None)
        .await
        .unwrap();

    let scanner = per_bucket_cleaner(&cluster, "janitor", Duration::from_millis(100));
    scanner.process_client(true).await.unwrap();

    assert!(
        repo.read_entry("_txn:atr-0", "old-attempt")
            .await
            .unwrap()
            .is_none(),
        "long-terminal residue row should have been pruned"
    );
    scanner.stop().await;
}

#[tokio::test]
async fn test_scan_survives_junk_rows() {
    let cluster = Arc::new(MemoryCluster::new());
    let coll = cluster.add_bucket("app");

    // A shard document with an unparseable row must not wedge the scan.
    coll.mutate_in(
        "_txn:atr-0",
        vec![MutateSpec::Upsert {
            path: "attempts.junk".to_string(),
            value: Value::String("not a row".into()),
        }],
        MutateOptions::default().semantics(StoreSemantics::Upsert),
    )
    .await
    .unwrap();

    let scanner = per_bucket_cleaner(&cluster, "sturdy", Duration::from_millis(100));
    scanner.process_client(true).await.unwrap();
    assert_eq!(scanner.run_count(), NUM_ATRS as u64);
    scanner.stop().await;
}
