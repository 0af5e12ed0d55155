//! Bounded background queue for attempt-originated cleanup
//!
//! Producers are attempt failure handlers; adding is non-blocking and simply
//! fails on a full queue — a dropped request is rediscovered by the
//! lost-transaction scan once the attempt expires, so the queue only buys
//! latency, never durability. A single consumer task delays each request
//! until it is ready, runs the cleaner, and survives every per-request
//! failure. Shutdown closes the queue for writes, cancels the current delay,
//! and hands back whatever was still queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::cleanup::{Cleaner, CleanupRequest, ProcessingErrors};

/// Default bound on queued cleanup requests.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

pub struct CleanupWorkQueue {
    tx: mpsc::Sender<CleanupRequest>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<Vec<CleanupRequest>>>>,
    processed_count: Arc<AtomicU64>,
    processing_errors: ProcessingErrors,
}

impl CleanupWorkQueue {
    /// Create the queue and spawn its consumer task.
    pub fn start(cleaner: Arc<Cleaner>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processed_count = Arc::new(AtomicU64::new(0));
        let processing_errors = ProcessingErrors::new();

        let consumer = tokio::spawn(consumer_loop(
            rx,
            cleaner,
            shutdown_rx,
            Arc::clone(&processed_count),
            processing_errors.clone(),
        ));

        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            consumer: Mutex::new(Some(consumer)),
            processed_count,
            processing_errors,
        }
    }

    /// Non-blocking enqueue. `false` means full or shut down; the caller
    /// relies on the scan path instead.
    pub fn try_add_cleanup_request(&self, req: CleanupRequest) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(req) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Cleanup work queue full; dropping request (scan path will recover)");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Requests processed so far.
    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::Relaxed)
    }

    /// Failures hit by the consumer; diagnostics only.
    pub fn processing_errors(&self) -> &ProcessingErrors {
        &self.processing_errors
    }

    /// Close the queue for writes and stop the consumer without waiting out
    /// pending delays. Returns the requests that were still queued, so a
    /// disposal path can process them synchronously if it wants to.
    pub async fn stop_processing(&self) -> Vec<CleanupRequest> {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let handle = self.consumer.lock().await.take();
        match handle {
            Some(handle) => match handle.await {
                Ok(remaining) => remaining,
                Err(e) => {
                    log::error!("Cleanup queue consumer panicked: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }
}

/// Consumer loop: delay each request until ready, then clean. Exits on
/// shutdown or when every sender is gone, returning undrained requests.
async fn consumer_loop(
    mut rx: mpsc::Receiver<CleanupRequest>,
    cleaner: Arc<Cleaner>,
    mut shutdown_rx: watch::Receiver<bool>,
    processed_count: Arc<AtomicU64>,
    processing_errors: ProcessingErrors,
) -> Vec<CleanupRequest> {
    log::debug!("Cleanup work queue consumer started");
    loop {
        let req = tokio::select! {
            _ = shutdown_rx.changed() => {
                return drain(&mut rx);
            }
            req = rx.recv() => match req {
                Some(req) => req,
                None => {
                    log::debug!("Cleanup work queue closed; consumer exiting");
                    return Vec::new();
                }
            },
        };

        // Wait until the request is ready, unless shutdown cuts the delay
        // short; an abandoned request falls back to the scan path.
        let delay = req.when_ready.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let mut remaining = vec![req];
                    remaining.extend(drain(&mut rx));
                    return remaining;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let result = cleaner.process_cleanup_request(&req).await;
        processed_count.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            if let Some(reason) = result.failure_reason {
                log::debug!(
                    "Background cleanup of attempt {} failed: {}",
                    req.attempt_id,
                    reason
                );
                processing_errors.record(reason);
            }
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<CleanupRequest>) -> Vec<CleanupRequest> {
    let mut remaining = Vec::new();
    while let Ok(req) = rx.try_recv() {
        remaining.push(req);
    }
    remaining
}
