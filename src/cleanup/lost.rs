//! Lost-transaction cleanup
//!
//! An attempt whose owning process died is discoverable only by scanning ATR
//! shards. Every running client heartbeats into each bucket's client record
//! and owns the slice of that bucket's shard space that the record implies;
//! it scans its slice once per cleanup window, paced so the pass spreads
//! evenly across the window, and routes every expired attempt it finds to the
//! [`Cleaner`]. When a client vanishes, its heartbeat expires and the
//! remaining clients recompute ownership on their next cycle, picking up its
//! shards without any handoff protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::atr::{atr_id_for_index, AtrRepository};
use crate::clientrecord::{ClientRecordDetails, ClientRecordRepository};
use crate::cleanup::{Cleaner, CleanupRequest, ProcessingErrors};
use crate::error::{ErrorClass, Result};
use crate::store::{Cluster, Collection};

/// Background cleanup loop owning a slice of one bucket's ATR space.
pub struct PerBucketCleaner {
    client_uuid: String,
    bucket: String,
    cleanup_window: Duration,
    num_atrs: u32,
    cleaner: Arc<Cleaner>,
    atr_repo: Arc<AtrRepository>,
    record_repo: Arc<ClientRecordRepository>,
    run_count: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PerBucketCleaner {
    pub fn new(
        client_uuid: String,
        collection: Arc<dyn Collection>,
        cleaner: Arc<Cleaner>,
        cleanup_window: Duration,
        num_atrs: u32,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client_uuid,
            bucket: collection.bucket().to_string(),
            cleanup_window,
            num_atrs,
            cleaner,
            atr_repo: Arc::new(AtrRepository::new(Arc::clone(&collection))),
            record_repo: Arc::new(ClientRecordRepository::new(collection)),
            run_count: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// ATRs handled so far, across all cycles.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the scan loop. Explicit, so lifecycle is not tied to
    /// construction order.
    pub async fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);
        let this = Arc::clone(&self);
        *handle = Some(tokio::spawn(async move {
            this.scan_loop().await;
        }));
        log::info!(
            "Started lost-transaction cleanup of bucket '{}' as client {}",
            self.bucket,
            self.client_uuid
        );
    }

    /// Stop the loop and remove this client's record entry, so the bucket
    /// does not spend a whole window believing a dead client owns shards.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                log::error!("Scan loop for bucket '{}' panicked: {}", self.bucket, e);
            }
        }
        self.running.store(false, Ordering::Release);
        self.record_repo.remove_with_retry(&self.client_uuid).await;
        log::debug!(
            "Stopped lost-transaction cleanup of bucket '{}' (client {})",
            self.bucket,
            self.client_uuid
        );
    }

    async fn scan_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let cycle_started = Instant::now();
            match self.process_client(true).await {
                Ok(_) => {}
                Err(e) => {
                    // A failed cycle is retried on the next interval.
                    log::warn!(
                        "Lost-transaction scan of bucket '{}' failed: {}",
                        self.bucket,
                        e
                    );
                }
            }

            if *shutdown_rx.borrow() {
                return;
            }
            let remaining = self.cleanup_window.saturating_sub(cycle_started.elapsed());
            if !remaining.is_zero() {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        }
    }

    /// One cycle: heartbeat, recompute ownership, scan owned shards.
    ///
    /// `scan_atrs` exists so tests can exercise the ownership protocol
    /// without paying for a shard scan.
    pub async fn process_client(&self, scan_atrs: bool) -> Result<ClientRecordDetails> {
        let details = self.ensure_client_record().await?;
        log::debug!(
            "Client {} owns {}/{} ATRs of bucket '{}' ({} active, {} expired clients)",
            self.client_uuid,
            details.atr_indexes.len(),
            self.num_atrs,
            self.bucket,
            details.active_client_ids.len(),
            details.expired_client_ids.len()
        );

        if scan_atrs {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            for shard in &details.atr_indexes {
                if *shutdown_rx.borrow() {
                    break;
                }
                let started = Instant::now();
                self.cleanup_atr(&atr_id_for_index(*shard)).await;
                self.run_count.fetch_add(1, Ordering::Relaxed);

                // Pace the pass so it spreads across the window instead of
                // hammering the store in a burst.
                let delay = details.check_atr_time_window.saturating_sub(started.elapsed());
                if !delay.is_zero() {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Ok(details)
    }

    /// Heartbeat this client into the record, creating the record document
    /// if nobody has yet, and compute the resulting ownership view.
    async fn ensure_client_record(&self) -> Result<ClientRecordDetails> {
        let mut details = None;
        for _ in 0..3 {
            match self.record_repo.get().await? {
                Some((record, now_hlc_ms, _cas)) => {
                    details = Some(ClientRecordDetails::new(
                        &record,
                        now_hlc_ms,
                        &self.client_uuid,
                        self.cleanup_window,
                        self.num_atrs,
                    ));
                    break;
                }
                None => {
                    match self.record_repo.create_placeholder().await {
                        Ok(()) => {
                            log::debug!(
                                "Created placeholder client record on bucket '{}'",
                                self.bucket
                            );
                        }
                        Err(e) if e.error_class() == ErrorClass::FailDocAlreadyExists => {
                            // Another client created it first; same thing.
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }
            }
        }
        let details = details.ok_or_else(|| {
            crate::error::KeystoneError::Store(format!(
                "client record on bucket '{}' unreadable after creation",
                self.bucket
            ))
        })?;

        self.record_repo
            .update(
                &self.client_uuid,
                self.cleanup_window,
                self.num_atrs,
                &details.expired_client_ids,
            )
            .await?;

        Ok(details)
    }

    /// Scan one ATR shard: route expired attempts to the cleaner and prune
    /// long-terminal residue. Store errors here are logged and the shard is
    /// retried on the next cycle; a single attempt that fails to clean is
    /// recorded and left alone rather than retried inline.
    async fn cleanup_atr(&self, atr_id: &str) {
        let (attempts, now_hlc_ms) = match self.atr_repo.read_all_entries(atr_id).await {
            Ok(Some(found)) => found,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Failed to read ATR {} on '{}': {}", atr_id, self.bucket, e);
                return;
            }
        };

        let window_ms = self.cleanup_window.as_millis() as u64;
        for (attempt_id, entry) in attempts {
            if entry.state.is_terminal() {
                // Remove rows that have been terminal for longer than the
                // window, to bound shard document growth.
                if entry.is_expired(now_hlc_ms.saturating_sub(window_ms)) {
                    let _ = self
                        .atr_repo
                        .remove_entry(atr_id, &attempt_id, false, entry.durability)
                        .await;
                }
                continue;
            }
            if !entry.is_expired(now_hlc_ms) {
                continue;
            }

            log::info!(
                "Found lost attempt {} in {} on '{}' (state {})",
                attempt_id,
                atr_id,
                self.bucket,
                entry.state
            );
            let req = CleanupRequest {
                attempt_id: attempt_id.clone(),
                atr_id: atr_id.to_string(),
                atr_bucket: self.bucket.clone(),
                state: entry.state,
                inserted_ids: entry.inserted_ids.clone(),
                replaced_ids: entry.replaced_ids.clone(),
                removed_ids: entry.removed_ids.clone(),
                when_ready: Instant::now(),
                durability: entry.durability,
                forward_compat: entry.forward_compat.clone(),
                processing_errors: ProcessingErrors::new(),
            };
            let result = self.cleaner.process_cleanup_request(&req).await;
            if !result.success {
                log::warn!(
                    "Cleanup of lost attempt {} failed; leaving for next pass: {:?}",
                    attempt_id,
                    result.failure_reason
                );
            }
        }
    }
}

/// Discovers buckets and runs one [`PerBucketCleaner`] per bucket.
pub struct LostTransactionManager {
    cluster: Arc<dyn Cluster>,
    cleaner: Arc<Cleaner>,
    client_uuid: String,
    cleanup_window: Duration,
    cleanup_stats_interval: Duration,
    num_atrs: u32,
    cleaners: Arc<StdMutex<HashMap<String, Arc<PerBucketCleaner>>>>,
    total_discovered: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LostTransactionManager {
    /// Construct and start discovery. One client uuid identifies this
    /// process in every bucket's client record.
    pub async fn start(
        cluster: Arc<dyn Cluster>,
        cleaner: Arc<Cleaner>,
        cleanup_window: Duration,
        cleanup_stats_interval: Duration,
        num_atrs: u32,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            cluster,
            cleaner,
            client_uuid: Uuid::new_v4().to_string(),
            cleanup_window,
            cleanup_stats_interval,
            num_atrs,
            cleaners: Arc::new(StdMutex::new(HashMap::new())),
            total_discovered: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            handle: Mutex::new(None),
        });

        log::info!(
            "Lost transaction manager starting as client {}",
            manager.client_uuid
        );
        manager.discover_buckets().await;

        let this = Arc::clone(&manager);
        *manager.handle.lock().await = Some(tokio::spawn(async move {
            this.discovery_loop().await;
        }));

        manager
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    /// Buckets discovered over this manager's lifetime.
    pub fn discovered_bucket_count(&self) -> u64 {
        self.total_discovered.load(Ordering::Relaxed)
    }

    /// Per-bucket cleaners currently running.
    pub fn running_count(&self) -> usize {
        self.cleaners
            .lock()
            .expect("cleaners lock poisoned")
            .values()
            .filter(|c| c.running())
            .count()
    }

    /// ATRs handled across every bucket.
    pub fn total_run_count(&self) -> u64 {
        self.cleaners
            .lock()
            .expect("cleaners lock poisoned")
            .values()
            .map(|c| c.run_count())
            .sum()
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tick = self.cleanup_window.min(self.cleanup_stats_interval);
        let mut last_stats = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(tick) => {}
            }
            self.discover_buckets().await;
            if last_stats.elapsed() >= self.cleanup_stats_interval {
                log::info!(
                    "Lost transaction cleanup: {} buckets discovered, {} running, {} ATRs handled",
                    self.discovered_bucket_count(),
                    self.running_count(),
                    self.total_run_count()
                );
                last_stats = Instant::now();
            }
        }
    }

    /// Reconcile the cleaner set with the buckets currently reachable.
    async fn discover_buckets(&self) {
        let names = self.cluster.bucket_names();

        let mut added = Vec::new();
        let mut dropped = Vec::new();
        {
            let mut cleaners = self.cleaners.lock().expect("cleaners lock poisoned");
            for name in &names {
                if cleaners.contains_key(name) {
                    continue;
                }
                let collection = match self.cluster.collection(name) {
                    Some(c) => c,
                    None => continue,
                };
                let cleaner = Arc::new(PerBucketCleaner::new(
                    self.client_uuid.clone(),
                    collection,
                    Arc::clone(&self.cleaner),
                    self.cleanup_window,
                    self.num_atrs,
                ));
                cleaners.insert(name.clone(), Arc::clone(&cleaner));
                self.total_discovered.fetch_add(1, Ordering::Relaxed);
                added.push(cleaner);
            }

            let gone: Vec<String> = cleaners
                .keys()
                .filter(|name| !names.contains(*name))
                .cloned()
                .collect();
            for name in gone {
                if let Some(cleaner) = cleaners.remove(&name) {
                    dropped.push(cleaner);
                }
            }
        }

        for cleaner in added {
            cleaner.start().await;
        }
        for cleaner in dropped {
            log::info!("Bucket '{}' disappeared; stopping its cleaner", cleaner.bucket());
            cleaner.stop().await;
        }
    }

    /// Stop every per-bucket cleaner and remove this client from every
    /// bucket's client record. Blocks on the removals, never on outstanding
    /// cleanup work.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                log::error!("Bucket discovery loop panicked: {}", e);
            }
        }

        let cleaners: Vec<Arc<PerBucketCleaner>> = {
            let mut map = self.cleaners.lock().expect("cleaners lock poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for cleaner in cleaners {
            cleaner.stop().await;
        }
        log::info!(
            "Lost transaction manager stopped (client {})",
            self.client_uuid
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCluster;

    #[tokio::test]
    async fn test_manager_discovers_and_stops_buckets() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_bucket("app");
        cluster.add_bucket("orders");
        let cleaner = Arc::new(Cleaner::new(cluster.clone()));

        let manager = LostTransactionManager::start(
            cluster.clone(),
            cleaner,
            Duration::from_secs(60),
            Duration::from_secs(60),
            16,
        )
        .await;

        assert_eq!(manager.discovered_bucket_count(), 2);
        assert_eq!(manager.running_count(), 2);

        manager.shutdown().await;
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_removes_client_records() {
        let cluster = Arc::new(MemoryCluster::new());
        let coll = cluster.add_bucket("app");
        let cleaner = Arc::new(Cleaner::new(cluster.clone()));

        let manager = LostTransactionManager::start(
            cluster.clone(),
            cleaner,
            Duration::from_millis(100),
            Duration::from_secs(60),
            16,
        )
        .await;
        let client_uuid = manager.client_uuid().to_string();

        // Wait for the first heartbeat to land.
        let repo = ClientRecordRepository::new(coll.clone());
        let mut seen = false;
        for _ in 0..100 {
            if let Some((record, _, _)) = repo.get().await.unwrap() {
                if record.clients.contains_key(&client_uuid) {
                    seen = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "client never heartbeated");

        manager.shutdown().await;

        let (record, _, _) = repo.get().await.unwrap().unwrap();
        assert!(
            !record.clients.contains_key(&client_uuid),
            "client record entry not removed on shutdown"
        );
    }
}
