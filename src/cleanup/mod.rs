//! Cleanup subsystem
//!
//! Two independent paths converge on one idempotent operation
//! ([`Cleaner::process_cleanup_request`]):
//!
//! - the attempt's own failure handler enqueues a [`CleanupRequest`] onto the
//!   in-process [`CleanupWorkQueue`] for near-term retry;
//! - every running client periodically scans its share of each bucket's ATR
//!   space ([`lost::PerBucketCleaner`]) and routes expired, ownerless
//!   attempts to the same cleaner.
//!
//! The queue is a latency optimization only; the scan path is the durability
//! mechanism, so dropping a queued request is always safe.

pub mod cleaner;
pub mod lost;
pub mod queue;

pub use cleaner::Cleaner;
pub use lost::{LostTransactionManager, PerBucketCleaner};
pub use queue::CleanupWorkQueue;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;

use crate::atr::DocRecord;
use crate::attempt::AttemptState;
use crate::error::KeystoneError;
use crate::store::Durability;

/// Append-only sink of failures hit while processing cleanup work.
///
/// Shared by reference between a request's producer and the consumer purely
/// for diagnostics; never read on any decision path.
#[derive(Debug, Clone, Default)]
pub struct ProcessingErrors {
    errors: Arc<Mutex<Vec<KeystoneError>>>,
}

impl ProcessingErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: KeystoneError) {
        self.errors.lock().expect("errors lock poisoned").push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.lock().expect("errors lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<KeystoneError> {
        self.errors.lock().expect("errors lock poisoned").clone()
    }
}

/// Immutable snapshot of one attempt's recoverable state.
///
/// Created by the owning attempt's failure handler or by a lost-transaction
/// scan; consumed exactly once by the [`Cleaner`]. The error sink is the only
/// shared part and is append-only.
#[derive(Debug, Clone)]
pub struct CleanupRequest {
    pub attempt_id: String,
    pub atr_id: String,
    pub atr_bucket: String,
    pub state: AttemptState,
    pub inserted_ids: Vec<DocRecord>,
    pub replaced_ids: Vec<DocRecord>,
    pub removed_ids: Vec<DocRecord>,
    /// Earliest moment the queue consumer may process this request.
    pub when_ready: Instant,
    pub durability: Durability,
    /// Forward-compatibility metadata, carried through untouched.
    pub forward_compat: Option<Value>,
    pub processing_errors: ProcessingErrors,
}

/// Outcome of one cleanup pass over one attempt.
#[derive(Debug)]
pub struct CleanupResult {
    pub success: bool,
    pub failure_reason: Option<KeystoneError>,
}

impl CleanupResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            failure_reason: None,
        }
    }

    pub fn failed(reason: KeystoneError) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_errors_accumulate() {
        let errors = ProcessingErrors::new();
        assert!(errors.is_empty());

        let shared = errors.clone();
        shared.record(KeystoneError::Internal("one".into()));
        errors.record(KeystoneError::Internal("two".into()));

        // Clones share the same sink
        assert_eq!(errors.len(), 2);
        assert_eq!(shared.len(), 2);
        assert!(errors.snapshot().iter().any(|e| e.to_string() == "one"));
    }
}
