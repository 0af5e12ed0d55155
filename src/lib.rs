//! Keystone - client-side ACID transactions for distributed key-value stores
//!
//! Keystone layers multi-document, all-or-nothing transactions on top of a
//! store that only offers per-document CAS. Mutations are staged reversibly
//! inside the documents they target, bookkept in durable Active Transaction
//! Records (ATRs), and committed or rolled back by flipping one ATR row.
//! An attempt whose process dies mid-flight is finished by someone else:
//! every running client scans a share of the ATR space for expired attempts
//! and converges them, coordinating purely through CAS on ordinary documents.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Application attempts                       │
//! │     (stage mutations, commit / rollback, AttemptContext)    │
//! └─────────────────────────────────────────────────────────────┘
//!              │ staged docs + ATR rows          │ failure path
//!              ▼                                 ▼
//! ┌──────────────────────────┐    ┌────────────────────────────────┐
//! │  ATR / client record     │    │     Cleanup work queue         │
//! │  accessors (CAS-guarded) │    │  (bounded, single consumer)    │
//! └──────────────────────────┘    └────────────────────────────────┘
//!              │                                 │
//!              ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Lost transaction manager                      │
//! │   (per-bucket scan loops, shard ownership, Cleaner)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Distributed key-value store                    │
//! │        (get / insert / replace / remove / sub-doc)          │
//! └─────────────────────────────────────────────────────────────┘

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use uuid::Uuid;

pub mod atr;
pub mod attempt;
pub mod cleanup;
pub mod clientrecord;
pub mod error;
pub mod flags;
pub mod store;

pub use attempt::{AttemptContext, AttemptState, TransactionGetResult};
pub use cleanup::{CleanupRequest, CleanupResult, CleanupWorkQueue, Cleaner, LostTransactionManager};
pub use error::{ErrorClass, KeystoneError, Result};
pub use flags::{BehaviorFlags, FinalError, StateFlags};
pub use store::{Cluster, Collection, Durability};

use cleanup::queue::DEFAULT_QUEUE_CAPACITY;

/// Cleanup subsystem configuration
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Target period for one full pass over this client's ATR share.
    pub cleanup_window: Duration,
    /// How often the lost transaction manager logs its counters.
    pub cleanup_stats_interval: Duration,
    /// Fixed partition count of the ATR space.
    pub num_atrs: u32,
    /// Bound on the in-process cleanup work queue.
    pub queue_capacity: usize,
    /// Scan for attempts abandoned by dead clients.
    pub cleanup_lost_attempts: bool,
    /// Enqueue this client's own failed attempts for background cleanup.
    pub cleanup_client_attempts: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_window: Duration::from_secs(60),
            cleanup_stats_interval: Duration::from_secs(60),
            num_atrs: atr::DEFAULT_NUM_ATRS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
        }
    }
}

impl CleanupConfig {
    /// No background work at all; cleanup happens only through explicit
    /// cleaner calls. Intended for tests and short-lived tools.
    pub fn disabled() -> Self {
        Self {
            cleanup_lost_attempts: false,
            cleanup_client_attempts: false,
            ..Default::default()
        }
    }
}

/// Transaction engine configuration
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Budget for one attempt to reach a terminal state.
    pub expiration_time: Duration,
    /// Durability required of every staged and committed write.
    pub durability: Durability,
    pub cleanup: CleanupConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration_time: Duration::from_secs(15),
            durability: Durability::Majority,
            cleanup: CleanupConfig::default(),
        }
    }
}

/// The transaction engine: owns the cleanup machinery and mints attempts.
pub struct Transactions {
    cluster: Arc<dyn Cluster>,
    config: TransactionConfig,
    cleaner: Arc<Cleaner>,
    work_queue: CleanupWorkQueue,
    lost_cleanup: Option<Arc<LostTransactionManager>>,
}

impl Transactions {
    /// Construct the engine and start its background loops.
    pub async fn start(cluster: Arc<dyn Cluster>, config: TransactionConfig) -> Self {
        let cleaner = Arc::new(Cleaner::new(Arc::clone(&cluster)));
        let work_queue =
            CleanupWorkQueue::start(Arc::clone(&cleaner), config.cleanup.queue_capacity);

        let lost_cleanup = if config.cleanup.cleanup_lost_attempts {
            Some(
                LostTransactionManager::start(
                    Arc::clone(&cluster),
                    Arc::clone(&cleaner),
                    config.cleanup.cleanup_window,
                    config.cleanup.cleanup_stats_interval,
                    config.cleanup.num_atrs,
                )
                .await,
            )
        } else {
            None
        };

        Self {
            cluster,
            config,
            cleaner,
            work_queue,
            lost_cleanup,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn cleaner(&self) -> &Arc<Cleaner> {
        &self.cleaner
    }

    pub fn lost_cleanup(&self) -> Option<&Arc<LostTransactionManager>> {
        self.lost_cleanup.as_ref()
    }

    /// Begin a new attempt under a fresh transaction id.
    pub fn attempt(&self) -> AttemptContext {
        AttemptContext::new(
            Arc::clone(&self.cluster),
            self.config.clone(),
            Uuid::new_v4().to_string(),
        )
    }

    /// Another attempt of an existing transaction (retry path).
    pub fn attempt_for(&self, transaction_id: &str) -> AttemptContext {
        AttemptContext::new(
            Arc::clone(&self.cluster),
            self.config.clone(),
            transaction_id.to_string(),
        )
    }

    /// Failure-path hook: enqueue an attempt's recoverable state for
    /// background cleanup. Returns whether the request was accepted; a
    /// dropped request is recovered by the lost-attempt scan.
    pub fn add_cleanup_request(&self, ctx: &AttemptContext) -> bool {
        if !self.config.cleanup.cleanup_client_attempts {
            return false;
        }
        match ctx.cleanup_request() {
            Some(req) => {
                let accepted = self.work_queue.try_add_cleanup_request(req);
                if !accepted {
                    warn!(
                        "Failed to enqueue background cleanup for attempt {}",
                        ctx.attempt_id()
                    );
                }
                accepted
            }
            None => false,
        }
    }

    /// Stop all background work. Remaining queued client-attempt requests
    /// are processed synchronously; the lost transaction manager removes
    /// this client from every bucket's client record before returning.
    pub async fn shutdown(&self) {
        let remaining = self.work_queue.stop_processing().await;
        if self.config.cleanup.cleanup_client_attempts {
            for req in remaining {
                let result = self.cleaner.process_cleanup_request(&req).await;
                if !result.success {
                    log::debug!(
                        "Disposal-time cleanup of attempt {} failed; scan path will recover: {:?}",
                        req.attempt_id,
                        result.failure_reason
                    );
                }
            }
        }

        if let Some(lost) = &self.lost_cleanup {
            lost.shutdown().await;
        }
    }
}
