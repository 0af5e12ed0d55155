//! Transaction attempt lifecycle
//!
//! One attempt is one logical try of a transaction. The application drives it
//! sequentially: each mutation is staged into the target document (reversibly,
//! under a `txn` marker) and bookkept in the attempt's ATR row, then `commit`
//! or `rollback` drives the attempt to a terminal state. If the owning
//! process dies first, the cleanup subsystem finds the ATR row and finishes
//! the job; everything staged here is written so that a cleaner can converge
//! it from the durable record alone.
//!
//! ## Attempt states
//!
//! ```text
//! NOTHING_WRITTEN -> PENDING -> COMMITTED -> COMPLETED
//!                           \-> ABORTED   -> ROLLED_BACK
//! ```
//!
//! plus a terminal UNKNOWN for indeterminate outcomes. Only the owning
//! attempt or a cleaner acting on its behalf drives transitions, never both
//! concurrently: the ATR document CAS arbitrates.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::atr::{atr_id_for_key, AtrEntry, AtrRepository, DocRecord};
use crate::cleanup::{CleanupRequest, ProcessingErrors};
use crate::error::{KeystoneError, Result};
use crate::flags::{BehaviorFlags, FinalError, StateFlags};
use crate::store::{Cas, Cluster, Collection, MutateOptions, MutateSpec};
use crate::TransactionConfig;

/// Reserved top-level key marking a document as staged by an attempt.
pub(crate) const TXN_MARKER_KEY: &str = "txn";

/// State of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    NothingWritten,
    Pending,
    Committed,
    Completed,
    Aborted,
    RolledBack,
    Unknown,
}

impl AttemptState {
    /// Terminal states: nothing more will ever happen to this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Completed | AttemptState::RolledBack | AttemptState::Unknown
        )
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        matches!(
            (self, next),
            (AttemptState::NothingWritten, AttemptState::Pending)
                | (AttemptState::Pending, AttemptState::Committed)
                | (AttemptState::Pending, AttemptState::Aborted)
                | (AttemptState::Committed, AttemptState::Completed)
                | (AttemptState::Aborted, AttemptState::RolledBack)
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptState::NothingWritten => "NOTHING_WRITTEN",
            AttemptState::Pending => "PENDING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Aborted => "ABORTED",
            AttemptState::RolledBack => "ROLLED_BACK",
            AttemptState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Kind of operation staged against a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedMutationKind {
    Insert,
    Replace,
    Remove,
}

/// The `txn` marker embedded in a staged document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TxnMarker {
    pub id: MarkerIds,
    pub op: MarkerOp,
    pub atr: MarkerAtr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MarkerIds {
    #[serde(rename = "txn")]
    pub transaction_id: String,
    #[serde(rename = "atmpt")]
    pub attempt_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MarkerOp {
    #[serde(rename = "type")]
    pub kind: StagedMutationKind,
    /// Content the attempt intends the document to have after commit.
    /// Absent for staged removes.
    #[serde(rename = "stgd", default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MarkerAtr {
    pub id: String,
    #[serde(rename = "bkt")]
    pub bucket: String,
}

/// Parse the marker out of a document body, if present.
pub(crate) fn marker_of(content: &Value) -> Option<TxnMarker> {
    let raw = content.as_object()?.get(TXN_MARKER_KEY)?;
    serde_json::from_value(raw.clone()).ok()
}

/// The document body without its marker.
pub(crate) fn strip_marker(content: &Value) -> Value {
    match content.as_object() {
        Some(map) => {
            let mut clean = map.clone();
            clean.remove(TXN_MARKER_KEY);
            Value::Object(clean)
        }
        None => content.clone(),
    }
}

/// One staged, reversible document mutation.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    pub doc: DocRecord,
    pub kind: StagedMutationKind,
    /// Post-commit content; `None` for removes.
    pub staged_content: Option<Value>,
    /// Document CAS after staging; guards every undo so a repeated undo is a
    /// no-op once the document has moved on.
    pub cas: Cas,
}

/// Per-attempt record of every document the attempt has touched.
///
/// Bookkeeping is sequential (the application drives one mutation at a time),
/// so no lock is needed.
#[derive(Debug, Default)]
pub struct StagedMutationSet {
    items: Vec<StagedMutation>,
}

impl StagedMutationSet {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Record a staged operation. Re-staging the same document updates the
    /// existing entry; a document first staged as an insert stays an insert
    /// (re-staging only changes what content will be committed).
    pub fn stage(&mut self, mut mutation: StagedMutation) {
        if let Some(existing) = self
            .items
            .iter_mut()
            .find(|m| m.doc == mutation.doc)
        {
            if existing.kind == StagedMutationKind::Insert {
                mutation.kind = StagedMutationKind::Insert;
            }
            *existing = mutation;
        } else {
            self.items.push(mutation);
        }
    }

    pub fn find(&self, doc: &DocRecord) -> Option<&StagedMutation> {
        self.items.iter().find(|m| &m.doc == doc)
    }

    /// Forget a staged entry (used when an attempt deletes its own staged
    /// insert, which nets out to nothing).
    pub fn unstage(&mut self, doc: &DocRecord) {
        self.items.retain(|m| &m.doc != doc);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &StagedMutation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn records_of_kind(&self, kind: StagedMutationKind) -> Vec<DocRecord> {
        self.items
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.doc.clone())
            .collect()
    }
}

/// A document read within an attempt, carrying what `replace`/`remove` need.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    pub record: DocRecord,
    pub content: Value,
    pub cas: Cas,
}

struct AtrHandle {
    repo: AtrRepository,
    atr_id: String,
    bucket: String,
}

/// One transaction attempt, owned exclusively by the in-process context until
/// it reaches a terminal state or is abandoned.
pub struct AttemptContext {
    cluster: Arc<dyn Cluster>,
    config: TransactionConfig,
    transaction_id: String,
    attempt_id: String,
    state: AttemptState,
    staged: StagedMutationSet,
    atr: Option<AtrHandle>,
    flags: Arc<StateFlags>,
    deadline: Instant,
    start_wall_ms: u64,
}

impl AttemptContext {
    pub(crate) fn new(
        cluster: Arc<dyn Cluster>,
        config: TransactionConfig,
        transaction_id: String,
    ) -> Self {
        let deadline = Instant::now() + config.expiration_time;
        let start_wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            cluster,
            config,
            transaction_id,
            attempt_id: Uuid::new_v4().to_string(),
            state: AttemptState::NothingWritten,
            staged: StagedMutationSet::new(),
            atr: None,
            flags: Arc::new(StateFlags::new()),
            deadline,
            start_wall_ms,
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn flags(&self) -> &StateFlags {
        &self.flags
    }

    /// The ATR shard this attempt records itself in, once known.
    pub fn atr_id(&self) -> Option<&str> {
        self.atr.as_ref().map(|h| h.atr_id.as_str())
    }

    fn check_expiry(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            self.flags.set_flags(
                BehaviorFlags::COMMIT_NOT_ALLOWED | BehaviorFlags::SHOULD_NOT_RETRY,
                FinalError::TransactionExpired,
            );
            return Err(KeystoneError::AttemptExpired(self.attempt_id.clone()));
        }
        Ok(())
    }

    fn collection_for(&self, bucket: &str) -> Result<Arc<dyn Collection>> {
        self.cluster
            .collection(bucket)
            .ok_or_else(|| KeystoneError::Store(format!("unknown bucket '{}'", bucket)))
    }

    fn build_entry(&self, state: AttemptState) -> AtrEntry {
        AtrEntry {
            transaction_id: self.transaction_id.clone(),
            state,
            timestamp_start_ms: self.start_wall_ms,
            expires_after_ms: self.config.expiration_time.as_millis() as u64,
            durability: self.config.durability,
            inserted_ids: self.staged.records_of_kind(StagedMutationKind::Insert),
            replaced_ids: self.staged.records_of_kind(StagedMutationKind::Replace),
            removed_ids: self.staged.records_of_kind(StagedMutationKind::Remove),
            forward_compat: None,
        }
    }

    /// First mutation creates the ATR row: the attempt becomes discoverable
    /// and PENDING from here on.
    async fn ensure_atr(&mut self, bucket: &str, first_key: &str) -> Result<()> {
        if self.atr.is_some() {
            return Ok(());
        }
        debug_assert!(self.state.can_transition_to(AttemptState::Pending));

        let atr_id = atr_id_for_key(first_key, self.config.cleanup.num_atrs);
        let collection = self.collection_for(bucket)?;
        let repo = AtrRepository::new(collection);
        let entry = self.build_entry(AttemptState::Pending);
        repo.write_entry(&atr_id, &self.attempt_id, &entry, self.config.durability)
            .await?;

        log::debug!(
            "Attempt {} now PENDING in {}/{}",
            self.attempt_id,
            bucket,
            atr_id
        );
        self.atr = Some(AtrHandle {
            repo,
            atr_id,
            bucket: bucket.to_string(),
        });
        self.state = AttemptState::Pending;
        Ok(())
    }

    /// Rewrite this attempt's ATR row with the current staged lists and `state`.
    async fn update_atr(&self, state: AttemptState) -> Result<()> {
        let handle = self
            .atr
            .as_ref()
            .expect("update_atr called before any mutation");
        let entry = self.build_entry(state);
        handle
            .repo
            .write_entry(&handle.atr_id, &self.attempt_id, &entry, self.config.durability)
            .await
    }

    fn marker(&self, kind: StagedMutationKind, staged: Option<Value>) -> TxnMarker {
        let handle = self.atr.as_ref().expect("marker built before ATR exists");
        TxnMarker {
            id: MarkerIds {
                transaction_id: self.transaction_id.clone(),
                attempt_id: self.attempt_id.clone(),
            },
            op: MarkerOp { kind, staged },
            atr: MarkerAtr {
                id: handle.atr_id.clone(),
                bucket: handle.bucket.clone(),
            },
        }
    }

    fn check_mutable(&self) -> Result<()> {
        match self.state {
            AttemptState::NothingWritten | AttemptState::Pending => Ok(()),
            other => Err(KeystoneError::Internal(format!(
                "attempt {} cannot stage mutations in state {}",
                self.attempt_id, other
            ))),
        }
    }

    /// Read a document as this attempt sees it: own staged content is
    /// visible, other attempts' staged inserts are not, and other attempts'
    /// staged replaces/removes read as their pre-image.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<TransactionGetResult> {
        self.check_expiry()?;
        let collection = self.collection_for(bucket)?;
        let result = collection.get(key).await?;
        let record = DocRecord::new(bucket, collection.name(), key);

        match marker_of(&result.content) {
            Some(marker) if marker.id.attempt_id == self.attempt_id => match marker.op.kind {
                StagedMutationKind::Remove => {
                    Err(KeystoneError::DocumentNotFound(key.to_string()))
                }
                _ => Ok(TransactionGetResult {
                    record,
                    content: marker.op.staged.unwrap_or(Value::Null),
                    cas: result.cas,
                }),
            },
            Some(marker) if marker.op.kind == StagedMutationKind::Insert => {
                // Someone else's uncommitted insert is invisible.
                Err(KeystoneError::DocumentNotFound(key.to_string()))
            }
            _ => Ok(TransactionGetResult {
                record,
                content: strip_marker(&result.content),
                cas: result.cas,
            }),
        }
    }

    /// Stage an insert: the document is created holding only the marker, so
    /// readers outside this attempt do not see it until commit.
    pub async fn insert(&mut self, bucket: &str, key: &str, content: Value) -> Result<()> {
        self.check_expiry()?;
        self.check_mutable()?;
        self.ensure_atr(bucket, key).await?;

        let collection = self.collection_for(bucket)?;
        let marker = self.marker(StagedMutationKind::Insert, Some(content.clone()));
        let mut body = serde_json::Map::new();
        body.insert(TXN_MARKER_KEY.to_string(), serde_json::to_value(&marker)?);

        let cas = match collection
            .insert(key, Value::Object(body), self.config.durability)
            .await
        {
            Ok(cas) => cas,
            Err(e) => return Err(self.classify_stage_failure(e)),
        };

        self.staged.stage(StagedMutation {
            doc: DocRecord::new(bucket, collection.name(), key),
            kind: StagedMutationKind::Insert,
            staged_content: Some(content),
            cas,
        });
        self.update_atr(AttemptState::Pending).await
    }

    /// Stage a replace: the new content rides in the marker; the body keeps
    /// the pre-image until commit.
    pub async fn replace(&mut self, doc: &TransactionGetResult, content: Value) -> Result<()> {
        self.check_expiry()?;
        self.check_mutable()?;
        self.ensure_atr(&doc.record.bucket, &doc.record.key).await?;

        let kind = match self.staged.find(&doc.record) {
            Some(m) if m.kind == StagedMutationKind::Insert => StagedMutationKind::Insert,
            _ => StagedMutationKind::Replace,
        };
        let collection = self.collection_for(&doc.record.bucket)?;
        let marker = self.marker(kind, Some(content.clone()));
        let cas_precondition = self
            .staged
            .find(&doc.record)
            .map(|m| m.cas)
            .unwrap_or(doc.cas);

        let cas = match collection
            .mutate_in(
                &doc.record.key,
                vec![MutateSpec::Upsert {
                    path: TXN_MARKER_KEY.to_string(),
                    value: serde_json::to_value(&marker)?,
                }],
                MutateOptions::default()
                    .cas(cas_precondition)
                    .durability(self.config.durability),
            )
            .await
        {
            Ok(cas) => cas,
            Err(e) => return Err(self.classify_stage_failure(e)),
        };

        self.staged.stage(StagedMutation {
            doc: doc.record.clone(),
            kind,
            staged_content: Some(content),
            cas,
        });
        self.update_atr(AttemptState::Pending).await
    }

    /// Stage a remove: the body and pre-image stay put; only the marker
    /// records the intent. Removing this attempt's own staged insert instead
    /// deletes the staged document outright, netting to nothing.
    pub async fn remove(&mut self, doc: &TransactionGetResult) -> Result<()> {
        self.check_expiry()?;
        self.check_mutable()?;
        self.ensure_atr(&doc.record.bucket, &doc.record.key).await?;

        let collection = self.collection_for(&doc.record.bucket)?;

        if let Some(staged) = self.staged.find(&doc.record) {
            if staged.kind == StagedMutationKind::Insert {
                let cas = staged.cas;
                if let Err(e) = collection
                    .remove(&doc.record.key, cas, self.config.durability)
                    .await
                {
                    return Err(self.classify_stage_failure(e));
                }
                self.staged.unstage(&doc.record);
                return self.update_atr(AttemptState::Pending).await;
            }
        }

        let marker = self.marker(StagedMutationKind::Remove, None);
        let cas_precondition = self
            .staged
            .find(&doc.record)
            .map(|m| m.cas)
            .unwrap_or(doc.cas);

        let cas = match collection
            .mutate_in(
                &doc.record.key,
                vec![MutateSpec::Upsert {
                    path: TXN_MARKER_KEY.to_string(),
                    value: serde_json::to_value(&marker)?,
                }],
                MutateOptions::default()
                    .cas(cas_precondition)
                    .durability(self.config.durability),
            )
            .await
        {
            Ok(cas) => cas,
            Err(e) => return Err(self.classify_stage_failure(e)),
        };

        self.staged.stage(StagedMutation {
            doc: doc.record.clone(),
            kind: StagedMutationKind::Remove,
            staged_content: None,
            cas,
        });
        self.update_atr(AttemptState::Pending).await
    }

    /// Record a staging failure in the attempt's flags before surfacing it.
    /// The attempt may no longer commit; a fresh attempt may still succeed,
    /// so retry stays permitted.
    fn classify_stage_failure(&self, e: KeystoneError) -> KeystoneError {
        self.flags.set_flags(
            BehaviorFlags::COMMIT_NOT_ALLOWED,
            FinalError::TransactionFailed,
        );
        e
    }

    fn failed(&self, final_error: FinalError) -> KeystoneError {
        KeystoneError::TransactionFailed {
            final_error,
            attempt_id: self.attempt_id.clone(),
            atr_id: self.atr.as_ref().map(|h| h.atr_id.clone()),
        }
    }

    /// Drive the attempt to COMPLETED: make every staged mutation visible.
    ///
    /// The PENDING -> COMMITTED transition on the durable ATR row is the
    /// commit point; unstaging after it is best-effort and any stragglers are
    /// converged by cleanup.
    pub async fn commit(&mut self) -> Result<()> {
        if self.flags.is_flag_set(BehaviorFlags::COMMIT_NOT_ALLOWED) {
            let final_error = match self.flags.final_error() {
                FinalError::None => FinalError::TransactionFailed,
                other => other,
            };
            return Err(self.failed(final_error));
        }
        if self.check_expiry().is_err() {
            return Err(self.failed(FinalError::TransactionExpired));
        }

        if self.state == AttemptState::NothingWritten {
            // Nothing staged, nothing durable; trivially done.
            return Ok(());
        }
        if self.state != AttemptState::Pending {
            return Err(KeystoneError::Internal(format!(
                "attempt {} cannot commit from state {}",
                self.attempt_id, self.state
            )));
        }

        // Commit point. After this write the attempt must roll forward.
        if let Err(e) = self.update_atr(AttemptState::Committed).await {
            self.flags.set_flags(
                BehaviorFlags::COMMIT_NOT_ALLOWED,
                FinalError::TransactionCommitAmbiguous,
            );
            log::warn!(
                "Attempt {} commit write failed, outcome ambiguous: {}",
                self.attempt_id,
                e
            );
            return Err(self.failed(FinalError::TransactionCommitAmbiguous));
        }
        self.state = AttemptState::Committed;
        self.flags.set_flags(
            BehaviorFlags::APP_ROLLBACK_NOT_ALLOWED | BehaviorFlags::SHOULD_NOT_ROLLBACK,
            FinalError::None,
        );

        // Unstage every document. Individual failures are collected, not
        // fatal; cleanup converges whatever is left.
        let mut failures = 0usize;
        for m in self.staged.iter() {
            let outcome = self.unstage_committed(m).await;
            if let Err(e) = outcome {
                if e.is_converged_signal() {
                    continue;
                }
                failures += 1;
                log::warn!(
                    "Attempt {} failed to unstage {}: {}",
                    self.attempt_id,
                    m.doc.key,
                    e
                );
                self.flags.set_flags(
                    BehaviorFlags::SHOULD_NOT_ROLLBACK,
                    FinalError::TransactionFailedPostCommit,
                );
            }
        }

        if failures > 0 {
            return Err(self.failed(FinalError::TransactionFailedPostCommit));
        }

        if let Some(handle) = &self.atr {
            handle
                .repo
                .remove_entry(&handle.atr_id, &self.attempt_id, false, self.config.durability)
                .await?;
        }
        self.state = AttemptState::Completed;
        log::debug!("Attempt {} COMPLETED", self.attempt_id);
        Ok(())
    }

    async fn unstage_committed(&self, m: &StagedMutation) -> Result<()> {
        let collection = self.collection_for(&m.doc.bucket)?;
        match m.kind {
            StagedMutationKind::Insert | StagedMutationKind::Replace => {
                let content = m
                    .staged_content
                    .clone()
                    .ok_or_else(|| KeystoneError::Internal("staged content missing".into()))?;
                collection
                    .replace(&m.doc.key, content, m.cas, self.config.durability)
                    .await?;
            }
            StagedMutationKind::Remove => {
                collection
                    .remove(&m.doc.key, m.cas, self.config.durability)
                    .await?;
            }
        }
        Ok(())
    }

    /// Roll the attempt back to ROLLED_BACK, restoring pre-images.
    ///
    /// Safe to call more than once: each undo is CAS-guarded against the
    /// document's last-known CAS, so a repeat pass is a no-op on documents
    /// that already converged. A single document that fails to undo is
    /// recorded and skipped; cleanup retries it later.
    pub async fn rollback(&mut self) -> Result<()> {
        self.rollback_inner(true).await
    }

    pub(crate) async fn rollback_inner(&mut self, app_initiated: bool) -> Result<()> {
        if self.state.is_terminal() || self.state == AttemptState::NothingWritten {
            return Ok(());
        }
        if app_initiated && self.flags.is_flag_set(BehaviorFlags::APP_ROLLBACK_NOT_ALLOWED) {
            return Err(self.failed(match self.flags.final_error() {
                FinalError::None => FinalError::TransactionFailed,
                other => other,
            }));
        }
        if self.flags.is_flag_set(BehaviorFlags::SHOULD_NOT_ROLLBACK) {
            return Err(self.failed(match self.flags.final_error() {
                FinalError::None => FinalError::TransactionFailed,
                other => other,
            }));
        }

        if self.state == AttemptState::Pending {
            self.update_atr(AttemptState::Aborted).await?;
            self.state = AttemptState::Aborted;
            self.flags.set_flags(
                BehaviorFlags::COMMIT_NOT_ALLOWED | BehaviorFlags::APP_ROLLBACK_NOT_ALLOWED,
                FinalError::None,
            );
        }

        // Replay the staged set in reverse, restoring pre-images.
        let mut failures = 0usize;
        for m in self.staged.iter().rev() {
            let outcome = self.undo_staged(m).await;
            if let Err(e) = outcome {
                if e.is_converged_signal() {
                    continue;
                }
                failures += 1;
                log::warn!(
                    "Attempt {} failed to undo {}: {}",
                    self.attempt_id,
                    m.doc.key,
                    e
                );
            }
        }

        if let Some(handle) = &self.atr {
            handle
                .repo
                .remove_entry(&handle.atr_id, &self.attempt_id, false, self.config.durability)
                .await?;
        }
        self.state = AttemptState::RolledBack;
        if failures > 0 {
            log::warn!(
                "Attempt {} rolled back with {} documents left for cleanup",
                self.attempt_id,
                failures
            );
        } else {
            log::debug!("Attempt {} ROLLED_BACK", self.attempt_id);
        }
        Ok(())
    }

    async fn undo_staged(&self, m: &StagedMutation) -> Result<()> {
        let collection = self.collection_for(&m.doc.bucket)?;
        match m.kind {
            StagedMutationKind::Insert => {
                // Remove the marker-only document this attempt created.
                collection
                    .remove(&m.doc.key, m.cas, self.config.durability)
                    .await?;
            }
            StagedMutationKind::Replace | StagedMutationKind::Remove => {
                // Strip the marker; the body still holds the pre-image.
                collection
                    .mutate_in(
                        &m.doc.key,
                        vec![MutateSpec::Remove {
                            path: TXN_MARKER_KEY.to_string(),
                        }],
                        MutateOptions::default()
                            .cas(m.cas)
                            .durability(self.config.durability),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Snapshot this attempt's recoverable state for the background cleanup
    /// queue. `None` when nothing durable was ever written.
    pub fn cleanup_request(&self) -> Option<CleanupRequest> {
        let handle = self.atr.as_ref()?;
        let when_ready = if self.state.is_terminal() {
            Instant::now()
        } else {
            // A live-looking attempt must not be touched until its expiry
            // has definitely passed.
            self.deadline + Duration::from_millis(10)
        };
        Some(CleanupRequest {
            attempt_id: self.attempt_id.clone(),
            atr_id: handle.atr_id.clone(),
            atr_bucket: handle.bucket.clone(),
            state: self.state,
            inserted_ids: self.staged.records_of_kind(StagedMutationKind::Insert),
            replaced_ids: self.staged.records_of_kind(StagedMutationKind::Replace),
            removed_ids: self.staged.records_of_kind(StagedMutationKind::Remove),
            when_ready,
            durability: self.config.durability,
            forward_compat: None,
            processing_errors: ProcessingErrors::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCluster;
    use serde_json::json;

    #[test]
    fn test_state_transitions() {
        use AttemptState::*;
        assert!(NothingWritten.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Committed));
        assert!(Pending.can_transition_to(Aborted));
        assert!(Committed.can_transition_to(Completed));
        assert!(Aborted.can_transition_to(RolledBack));

        assert!(!NothingWritten.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Committed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Unknown.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_states() {
        assert!(AttemptState::Completed.is_terminal());
        assert!(AttemptState::RolledBack.is_terminal());
        assert!(AttemptState::Unknown.is_terminal());
        assert!(!AttemptState::Pending.is_terminal());
        assert!(!AttemptState::Committed.is_terminal());
        assert!(!AttemptState::Aborted.is_terminal());
    }

    #[test]
    fn test_state_serde_wire_form() {
        assert_eq!(
            serde_json::to_value(AttemptState::NothingWritten).unwrap(),
            json!("NOTHING_WRITTEN")
        );
        assert_eq!(
            serde_json::to_value(AttemptState::RolledBack).unwrap(),
            json!("ROLLED_BACK")
        );
        let back: AttemptState = serde_json::from_value(json!("PENDING")).unwrap();
        assert_eq!(back, AttemptState::Pending);
    }

    #[test]
    fn test_staged_set_restage_keeps_insert_kind() {
        let mut set = StagedMutationSet::new();
        let doc = DocRecord::new("app", "_default", "k1");
        set.stage(StagedMutation {
            doc: doc.clone(),
            kind: StagedMutationKind::Insert,
            staged_content: Some(json!({"v": 1})),
            cas: 1,
        });
        set.stage(StagedMutation {
            doc: doc.clone(),
            kind: StagedMutationKind::Replace,
            staged_content: Some(json!({"v": 2})),
            cas: 2,
        });

        assert_eq!(set.len(), 1);
        let m = set.find(&doc).unwrap();
        assert_eq!(m.kind, StagedMutationKind::Insert);
        assert_eq!(m.staged_content, Some(json!({"v": 2})));
        assert_eq!(m.cas, 2);
    }

    #[test]
    fn test_marker_roundtrip() {
        let marker = TxnMarker {
            id: MarkerIds {
                transaction_id: "t1".into(),
                attempt_id: "a1".into(),
            },
            op: MarkerOp {
                kind: StagedMutationKind::Replace,
                staged: Some(json!({"v": 2})),
            },
            atr: MarkerAtr {
                id: "_txn:atr-3".into(),
                bucket: "app".into(),
            },
        };
        let mut body = serde_json::Map::new();
        body.insert("balance".to_string(), json!(100));
        body.insert(
            TXN_MARKER_KEY.to_string(),
            serde_json::to_value(&marker).unwrap(),
        );
        let content = Value::Object(body);

        let parsed = marker_of(&content).unwrap();
        assert_eq!(parsed.id.attempt_id, "a1");
        assert_eq!(parsed.op.kind, StagedMutationKind::Replace);
        assert_eq!(parsed.op.staged, Some(json!({"v": 2})));

        let clean = strip_marker(&content);
        assert_eq!(clean, json!({"balance": 100}));
    }

    fn test_config() -> TransactionConfig {
        TransactionConfig {
            expiration_time: Duration::from_secs(15),
            ..TransactionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_insert_commit_makes_content_visible() {
        let cluster = Arc::new(MemoryCluster::new());
        let coll = cluster.add_bucket("app");

        let mut ctx = AttemptContext::new(cluster.clone(), test_config(), "t1".into());
        ctx.insert("app", "k1", json!({"v": 1})).await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Pending);

        // Staged insert is marker-only before commit
        let raw = coll.get("k1").await.unwrap();
        assert!(marker_of(&raw.content).is_some());
        assert!(strip_marker(&raw.content).as_object().unwrap().is_empty());

        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Completed);

        let raw = coll.get("k1").await.unwrap();
        assert_eq!(raw.content, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_replace_rollback_restores_preimage() {
        let cluster = Arc::new(MemoryCluster::new());
        let coll = cluster.add_bucket("app");
        coll.insert("k1", json!({"v": 1}), crate::store::Durability::None)
            .await
            .unwrap();

        let mut ctx = AttemptContext::new(cluster.clone(), test_config(), "t1".into());
        let doc = ctx.get("app", "k1").await.unwrap();
        ctx.replace(&doc, json!({"v": 2})).await.unwrap();

        // Pre-image still visible under the marker
        let raw = coll.get("k1").await.unwrap();
        assert_eq!(strip_marker(&raw.content), json!({"v": 1}));

        ctx.rollback().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::RolledBack);

        let raw = coll.get("k1").await.unwrap();
        assert_eq!(raw.content, json!({"v": 1}));

        // Second rollback is a no-op
        ctx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_commit_deletes_document() {
        let cluster = Arc::new(MemoryCluster::new());
        let coll = cluster.add_bucket("app");
        coll.insert("k1", json!({"v": 1}), crate::store::Durability::None)
            .await
            .unwrap();

        let mut ctx = AttemptContext::new(cluster.clone(), test_config(), "t1".into());
        let doc = ctx.get("app", "k1").await.unwrap();
        ctx.remove(&doc).await.unwrap();

        // Still present (with marker) before commit
        assert!(coll.get("k1").await.is_ok());

        ctx.commit().await.unwrap();
        assert!(coll.get("k1").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_own_staged_insert_nets_to_nothing() {
        let cluster = Arc::new(MemoryCluster::new());
        let coll = cluster.add_bucket("app");

        let mut ctx = AttemptContext::new(cluster.clone(), test_config(), "t1".into());
        ctx.insert("app", "k1", json!({"v": 1})).await.unwrap();
        let doc = ctx.get("app", "k1").await.unwrap();
        ctx.remove(&doc).await.unwrap();

        assert!(coll.get("k1").await.is_err());
        ctx.commit().await.unwrap();
        assert!(coll.get("k1").await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_staged_insert_is_invisible() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_bucket("app");

        let mut writer = AttemptContext::new(cluster.clone(), test_config(), "t1".into());
        writer.insert("app", "k1", json!({"v": 1})).await.unwrap();

        let reader = AttemptContext::new(cluster.clone(), test_config(), "t2".into());
        let err = reader.get("app", "k1").await.unwrap_err();
        assert!(matches!(err, KeystoneError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_attempt_refuses_commit() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_bucket("app");

        let config = TransactionConfig {
            expiration_time: Duration::from_millis(25),
            ..TransactionConfig::default()
        };
        let mut ctx = AttemptContext::new(cluster.clone(), config, "t1".into());
        ctx.insert("app", "k1", json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = ctx.commit().await.unwrap_err();
        match err {
            KeystoneError::TransactionFailed { final_error, .. } => {
                assert_eq!(final_error, FinalError::TransactionExpired);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(ctx.flags().is_flag_set(BehaviorFlags::SHOULD_NOT_RETRY));
    }

    #[tokio::test]
    async fn test_cleanup_request_snapshot() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_bucket("app");

        let mut ctx = AttemptContext::new(cluster.clone(), test_config(), "t1".into());
        assert!(ctx.cleanup_request().is_none());

        ctx.insert("app", "k1", json!({})).await.unwrap();
        let req = ctx.cleanup_request().unwrap();
        assert_eq!(req.attempt_id, ctx.attempt_id());
        assert_eq!(req.state, AttemptState::Pending);
        assert_eq!(req.inserted_ids.len(), 1);
        assert_eq!(req.inserted_ids[0].key, "k1");
        assert_eq!(req.atr_bucket, "app");
    }
}
