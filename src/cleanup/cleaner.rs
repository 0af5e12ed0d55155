//! Cleaner: drives one abandoned or finished attempt to convergence
//!
//! Given a [`CleanupRequest`], the cleaner re-reads the attempt's ATR row and
//! either completes the commit (COMMITTED rows), undoes the staged changes
//! (ABORTED rows, or PENDING rows past expiry), or does nothing because the
//! attempt already converged. Every document touch is CAS-guarded; a CAS
//! mismatch or missing document means someone else got there first and is
//! success, not failure. The whole operation is idempotent and safe to run
//! from any process, any number of times.

use std::sync::Arc;

use crate::atr::{AtrRepository, DocRecord};
use crate::attempt::{marker_of, AttemptState, StagedMutationKind, TxnMarker, TXN_MARKER_KEY};
use crate::cleanup::{CleanupRequest, CleanupResult};
use crate::error::{KeystoneError, Result};
use crate::store::{Cluster, Collection, Durability, GetResult, MutateOptions, MutateSpec};

pub struct Cleaner {
    cluster: Arc<dyn Cluster>,
}

impl Cleaner {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Converge one attempt. Returns success when the attempt is terminal
    /// afterwards or was already handled by someone else; failure leaves the
    /// attempt for a later scan pass.
    pub async fn process_cleanup_request(&self, req: &CleanupRequest) -> CleanupResult {
        log::debug!(
            "Processing cleanup request for attempt {} in {}/{}",
            req.attempt_id,
            req.atr_bucket,
            req.atr_id
        );

        let atr_collection = match self.cluster.collection(&req.atr_bucket) {
            Some(c) => c,
            None => {
                return CleanupResult::failed(KeystoneError::Store(format!(
                    "unknown bucket '{}'",
                    req.atr_bucket
                )))
            }
        };
        let repo = AtrRepository::new(Arc::clone(&atr_collection));

        // Re-read: the request's snapshot may be stale, and the row is the
        // authority on whether anything is left to do.
        let entry = match repo.read_entry(&req.atr_id, &req.attempt_id).await {
            Ok(entry) => entry,
            Err(e) => {
                req.processing_errors.record(e.clone());
                return CleanupResult::failed(e);
            }
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                // Row gone: the original attempt or another cleaner won.
                log::debug!(
                    "Attempt {} already cleaned up ({} has no row)",
                    req.attempt_id,
                    req.atr_id
                );
                return CleanupResult::ok();
            }
        };

        if entry.state.is_terminal() {
            // Terminal rows only need their residue removed.
            if let Err(e) = repo
                .remove_entry(&req.atr_id, &req.attempt_id, false, req.durability)
                .await
            {
                req.processing_errors.record(e.clone());
                return CleanupResult::failed(e);
            }
            return CleanupResult::ok();
        }

        // Prefer the re-read row's lists: they are at least as fresh as the
        // request's snapshot.
        let inserted = &entry.inserted_ids;
        let replaced = &entry.replaced_ids;
        let removed = &entry.removed_ids;

        let (action, was_pending) = match entry.state {
            AttemptState::Pending => {
                let expired = match self.atr_now(&repo, &req.atr_id).await {
                    Ok(now) => entry.is_expired(now),
                    Err(e) => {
                        req.processing_errors.record(e.clone());
                        return CleanupResult::failed(e);
                    }
                };
                if !expired {
                    // Possibly still owned by a live process; not ours to touch.
                    log::debug!(
                        "Attempt {} still PENDING and unexpired; leaving it",
                        req.attempt_id
                    );
                    return CleanupResult::ok();
                }
                (DocAction::Undo, true)
            }
            AttemptState::Aborted => (DocAction::Undo, false),
            AttemptState::Committed => (DocAction::RollForward, false),
            // NothingWritten rows should not exist durably; treat as abort.
            AttemptState::NothingWritten => (DocAction::Undo, true),
            _ => unreachable!("terminal states handled above"),
        };

        let mut first_failure: Option<KeystoneError> = None;
        for dr in inserted.iter().chain(replaced).chain(removed) {
            if let Err(e) = self.cleanup_doc(dr, &req.attempt_id, action, req.durability).await {
                log::warn!(
                    "Cleanup of {}/{} for attempt {} failed: {}",
                    dr.bucket,
                    dr.key,
                    req.attempt_id,
                    e
                );
                req.processing_errors.record(e.clone());
                first_failure.get_or_insert(e);
            }
        }

        if let Some(reason) = first_failure {
            // Leave the row; the next scan pass retries the stragglers.
            return CleanupResult::failed(reason);
        }

        match repo
            .remove_entry(&req.atr_id, &req.attempt_id, was_pending, req.durability)
            .await
        {
            Ok(()) => {
                log::info!(
                    "Attempt {}: ATR row {} cleaned up ({:?})",
                    req.attempt_id,
                    req.atr_id,
                    action
                );
                CleanupResult::ok()
            }
            Err(e) => {
                req.processing_errors.record(e.clone());
                CleanupResult::failed(e)
            }
        }
    }

    /// The bucket's logical clock, read through the ATR shard document.
    async fn atr_now(&self, repo: &AtrRepository, atr_id: &str) -> Result<u64> {
        match repo.read_all_entries(atr_id).await? {
            Some((_, now)) => Ok(now),
            None => Ok(0),
        }
    }

    /// Converge one staged document, deciding the concrete operation from
    /// the marker it carries right now.
    async fn cleanup_doc(
        &self,
        dr: &DocRecord,
        attempt_id: &str,
        action: DocAction,
        durability: Durability,
    ) -> Result<()> {
        let collection = self
            .cluster
            .collection(&dr.bucket)
            .ok_or_else(|| KeystoneError::Store(format!("unknown bucket '{}'", dr.bucket)))?;

        let (doc, marker) = match self.lookup_staged(&collection, &dr.key).await? {
            Some(found) => found,
            None => return Ok(()), // no marker: already converged
        };

        if marker.id.attempt_id != attempt_id {
            // The world has moved on; another attempt owns this document now.
            log::debug!(
                "Document {} staged by a different attempt; skipping",
                dr.key
            );
            return Ok(());
        }

        let outcome = match action {
            DocAction::Undo => self.undo_doc(&collection, dr, &doc, &marker, durability).await,
            DocAction::RollForward => {
                self.roll_forward_doc(&collection, dr, &doc, &marker, durability)
                    .await
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            // CAS mismatch or vanished document: converged by someone else.
            Err(e) if e.is_converged_signal() => {
                log::debug!("Document {} converged concurrently: {}", dr.key, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn lookup_staged(
        &self,
        collection: &Arc<dyn Collection>,
        key: &str,
    ) -> Result<Option<(GetResult, TxnMarker)>> {
        match collection.get(key).await {
            Ok(doc) => Ok(marker_of(&doc.content).map(|m| (doc, m))),
            Err(e) if e.is_converged_signal() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Restore the pre-image: staged inserts are removed, staged
    /// replaces/removes get their marker stripped (the body is the pre-image).
    async fn undo_doc(
        &self,
        collection: &Arc<dyn Collection>,
        dr: &DocRecord,
        doc: &GetResult,
        marker: &TxnMarker,
        durability: Durability,
    ) -> Result<()> {
        match marker.op.kind {
            StagedMutationKind::Insert => collection.remove(&dr.key, doc.cas, durability).await,
            StagedMutationKind::Replace | StagedMutationKind::Remove => collection
                .mutate_in(
                    &dr.key,
                    vec![MutateSpec::Remove {
                        path: TXN_MARKER_KEY.to_string(),
                    }],
                    MutateOptions::default().cas(doc.cas).durability(durability),
                )
                .await
                .map(|_| ()),
        }
    }

    /// Complete the commit: staged content becomes the body (marker gone),
    /// staged removes are removed.
    async fn roll_forward_doc(
        &self,
        collection: &Arc<dyn Collection>,
        dr: &DocRecord,
        doc: &GetResult,
        marker: &TxnMarker,
        durability: Durability,
    ) -> Result<()> {
        match marker.op.kind {
            StagedMutationKind::Insert | StagedMutationKind::Replace => {
                let content = marker.op.staged.clone().ok_or_else(|| {
                    KeystoneError::Decode(format!("staged content missing on {}", dr.key))
                })?;
                collection
                    .replace(&dr.key, content, doc.cas, durability)
                    .await
                    .map(|_| ())
            }
            StagedMutationKind::Remove => collection.remove(&dr.key, doc.cas, durability).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocAction {
    Undo,
    RollForward,
}
