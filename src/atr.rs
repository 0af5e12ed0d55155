//! Active Transaction Record access
//!
//! Every attempt records its state and the documents it touched in a durable
//! ATR row so any process can discover its outcome. Rows live inside a fixed
//! number of shard documents (one document holds many attempts); a staged
//! document's key hashes to the shard its attempt uses. All row writes go
//! through sub-document mutations guarded by the ATR document's CAS, so
//! concurrent attempts sharing a shard never clobber each other's rows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attempt::AttemptState;
use crate::error::{ErrorClass, KeystoneError, Result};
use crate::store::{
    Collection, Durability, LookupSpec, MutateOptions, MutateSpec, StoreSemantics, HLC_PATH,
};

/// Fixed partition count of the ATR space per bucket.
pub const DEFAULT_NUM_ATRS: u32 = 1024;

/// Field within an ATR document holding the attempt-id -> entry map.
pub const ATR_FIELD_ATTEMPTS: &str = "attempts";

/// Sentinel field written into a pending row just before removal, so a racing
/// reader cannot resurrect the row as a live pending attempt.
pub const ATR_FIELD_PENDING_SENTINEL: &str = "p";

const ATR_ID_PREFIX: &str = "_txn:atr-";

/// Bounded retry budget for CAS contention on one ATR document.
const MAX_CAS_RETRIES: usize = 16;

/// The ATR document id for shard `index`.
pub fn atr_id_for_index(index: u32) -> String {
    format!("{}{}", ATR_ID_PREFIX, index)
}

/// Map a document key to its ATR shard document id.
pub fn atr_id_for_key(key: &str, num_atrs: u32) -> String {
    let hash = crc32fast::hash(key.as_bytes());
    atr_id_for_index(hash % num_atrs)
}

/// Reference to one document touched by an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    #[serde(rename = "bkt")]
    pub bucket: String,
    #[serde(rename = "col")]
    pub collection: String,
    #[serde(rename = "id")]
    pub key: String,
}

impl DocRecord {
    pub fn new(
        bucket: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }
}

/// One attempt's row within an ATR shard document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrEntry {
    /// Owning transaction id.
    #[serde(rename = "tid")]
    pub transaction_id: String,
    /// Attempt state.
    #[serde(rename = "st")]
    pub state: AttemptState,
    /// Start timestamp (ms, comparable against the bucket HLC).
    #[serde(rename = "tst")]
    pub timestamp_start_ms: u64,
    /// Expiry budget from start (ms).
    #[serde(rename = "exp")]
    pub expires_after_ms: u64,
    /// Durability the attempt staged with.
    #[serde(rename = "d")]
    pub durability: Durability,
    #[serde(rename = "ins", default)]
    pub inserted_ids: Vec<DocRecord>,
    #[serde(rename = "rep", default)]
    pub replaced_ids: Vec<DocRecord>,
    #[serde(rename = "rem", default)]
    pub removed_ids: Vec<DocRecord>,
    /// Forward-compatibility metadata, carried through untouched.
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compat: Option<Value>,
}

impl AtrEntry {
    /// Whether this row's expiry deadline has passed at `now_hlc_ms`.
    pub fn is_expired(&self, now_hlc_ms: u64) -> bool {
        now_hlc_ms > self.timestamp_start_ms.saturating_add(self.expires_after_ms)
    }
}

/// Reads and writes attempt rows within one bucket's ATR shard documents.
pub struct AtrRepository {
    collection: Arc<dyn Collection>,
}

impl AtrRepository {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    fn entry_path(attempt_id: &str) -> String {
        format!("{}.{}", ATR_FIELD_ATTEMPTS, attempt_id)
    }

    /// Upsert the row for `attempt_id`, guarded by the ATR document's CAS.
    ///
    /// A losing writer re-reads the document CAS and retries, bounded by
    /// `MAX_CAS_RETRIES`; contention beyond that surfaces as a store failure.
    pub async fn write_entry(
        &self,
        atr_id: &str,
        attempt_id: &str,
        entry: &AtrEntry,
        durability: Durability,
    ) -> Result<()> {
        let row = serde_json::to_value(entry)?;
        for _ in 0..MAX_CAS_RETRIES {
            // Re-read the document CAS; 0 means the shard document does not
            // exist yet and the write must create it.
            let cas = match self
                .collection
                .lookup_in(atr_id, vec![LookupSpec::get(ATR_FIELD_ATTEMPTS)])
                .await
            {
                Ok(result) => result.cas,
                Err(e) if e.error_class() == ErrorClass::FailDocNotFound => 0,
                Err(e) => return Err(e),
            };

            let semantics = if cas == 0 {
                StoreSemantics::Upsert
            } else {
                StoreSemantics::Replace
            };

            let outcome = self
                .collection
                .mutate_in(
                    atr_id,
                    vec![MutateSpec::Upsert {
                        path: Self::entry_path(attempt_id),
                        value: row.clone(),
                    }],
                    MutateOptions::default()
                        .cas(cas)
                        .durability(durability)
                        .semantics(semantics),
                )
                .await;

            match outcome {
                Ok(_) => return Ok(()),
                Err(e)
                    if matches!(
                        e.error_class(),
                        ErrorClass::FailCasMismatch | ErrorClass::FailDocAlreadyExists
                    ) =>
                {
                    // Lost the race for this shard document; re-read and retry.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(KeystoneError::Store(format!(
            "ATR write contention on '{}' not resolved within {} retries",
            atr_id, MAX_CAS_RETRIES
        )))
    }

    /// Read the row for `attempt_id`, if it still exists.
    pub async fn read_entry(&self, atr_id: &str, attempt_id: &str) -> Result<Option<AtrEntry>> {
        let result = match self
            .collection
            .lookup_in(atr_id, vec![LookupSpec::get(Self::entry_path(attempt_id))])
            .await
        {
            Ok(result) => result,
            Err(e) if e.error_class() == ErrorClass::FailDocNotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match result.content(0) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Read every row in the shard plus the bucket's logical clock, for
    /// recovery scanning. `None` if the shard document does not exist.
    pub async fn read_all_entries(
        &self,
        atr_id: &str,
    ) -> Result<Option<(HashMap<String, AtrEntry>, u64)>> {
        let result = match self
            .collection
            .lookup_in(
                atr_id,
                vec![
                    LookupSpec::get(ATR_FIELD_ATTEMPTS),
                    LookupSpec::get(HLC_PATH),
                ],
            )
            .await
        {
            Ok(result) => result,
            Err(e) if e.error_class() == ErrorClass::FailDocNotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let attempts = match result.content(0) {
            Some(value) => {
                let raw: HashMap<String, Value> = serde_json::from_value(value.clone())?;
                // Rows another client is mid-removal on can be partial;
                // skip anything that no longer parses as an entry.
                raw.into_iter()
                    .filter_map(|(id, row)| {
                        serde_json::from_value::<AtrEntry>(row).ok().map(|e| (id, e))
                    })
                    .collect()
            }
            None => HashMap::new(),
        };

        let now_hlc_ms = result
            .content(1)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| KeystoneError::Decode("missing HLC in ATR lookup".to_string()))?;

        Ok(Some((attempts, now_hlc_ms)))
    }

    /// Remove the row for `attempt_id` — the terminal action for a completed
    /// or rolled-back attempt. A row still in `Pending` state gets the abort
    /// sentinel written in the same mutation. Missing document or row means
    /// someone else already converged it.
    pub async fn remove_entry(
        &self,
        atr_id: &str,
        attempt_id: &str,
        was_pending: bool,
        durability: Durability,
    ) -> Result<()> {
        let prefix = Self::entry_path(attempt_id);
        let mut specs = Vec::new();
        if was_pending {
            specs.push(MutateSpec::Insert {
                path: format!("{}.{}", prefix, ATR_FIELD_PENDING_SENTINEL),
                value: Value::from(0),
            });
        }
        specs.push(MutateSpec::Remove { path: prefix });

        match self
            .collection
            .mutate_in(
                atr_id,
                specs,
                MutateOptions::default().durability(durability),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_converged_signal() => {
                log::debug!(
                    "ATR row {}/{} already gone by the time removal was attempted",
                    atr_id,
                    attempt_id
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCollection;

    #[test]
    fn test_atr_id_mapping_is_stable_and_in_range() {
        let id1 = atr_id_for_key("customer::42", DEFAULT_NUM_ATRS);
        let id2 = atr_id_for_key("customer::42", DEFAULT_NUM_ATRS);
        assert_eq!(id1, id2);

        for key in ["a", "b", "customer::42", "order::17", ""] {
            let id = atr_id_for_key(key, 64);
            let index: u32 = id.strip_prefix(ATR_ID_PREFIX).unwrap().parse().unwrap();
            assert!(index < 64);
        }
    }

    #[test]
    fn test_entry_expiry() {
        let entry = AtrEntry {
            transaction_id: "t1".into(),
            state: AttemptState::Pending,
            timestamp_start_ms: 1000,
            expires_after_ms: 500,
            durability: Durability::None,
            inserted_ids: vec![],
            replaced_ids: vec![],
            removed_ids: vec![],
            forward_compat: None,
        };
        assert!(!entry.is_expired(1400));
        assert!(!entry.is_expired(1500));
        assert!(entry.is_expired(1501));
    }

    fn sample_entry(state: AttemptState) -> AtrEntry {
        AtrEntry {
            transaction_id: "t1".into(),
            state,
            timestamp_start_ms: 1,
            expires_after_ms: 15_000,
            durability: Durability::None,
            inserted_ids: vec![DocRecord::new("app", "_default", "k1")],
            replaced_ids: vec![],
            removed_ids: vec![],
            forward_compat: None,
        }
    }

    #[tokio::test]
    async fn test_write_read_remove_roundtrip() {
        let coll: Arc<dyn Collection> = Arc::new(MemoryCollection::new("app"));
        let repo = AtrRepository::new(coll);

        let entry = sample_entry(AttemptState::Pending);
        repo.write_entry("_txn:atr-3", "a1", &entry, Durability::None)
            .await
            .unwrap();

        let read = repo.read_entry("_txn:atr-3", "a1").await.unwrap().unwrap();
        assert_eq!(read.state, AttemptState::Pending);
        assert_eq!(read.inserted_ids.len(), 1);
        assert_eq!(read.inserted_ids[0].key, "k1");

        repo.remove_entry("_txn:atr-3", "a1", true, Durability::None)
            .await
            .unwrap();
        assert!(repo.read_entry("_txn:atr-3", "a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_entry_is_converged() {
        let coll: Arc<dyn Collection> = Arc::new(MemoryCollection::new("app"));
        let repo = AtrRepository::new(coll);

        // Document does not even exist
        repo.remove_entry("_txn:atr-9", "gone", false, Durability::None)
            .await
            .unwrap();

        // Document exists, row does not
        let entry = sample_entry(AttemptState::Pending);
        repo.write_entry("_txn:atr-9", "other", &entry, Durability::None)
            .await
            .unwrap();
        repo.remove_entry("_txn:atr-9", "gone", false, Durability::None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rows_in_same_shard_do_not_clobber() {
        let coll: Arc<dyn Collection> = Arc::new(MemoryCollection::new("app"));
        let repo = AtrRepository::new(coll);

        repo.write_entry("_txn:atr-0", "a1", &sample_entry(AttemptState::Pending), Durability::None)
            .await
            .unwrap();
        repo.write_entry("_txn:atr-0", "a2", &sample_entry(AttemptState::Committed), Durability::None)
            .await
            .unwrap();

        let (all, now) = repo.read_all_entries("_txn:atr-0").await.unwrap().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a1"].state, AttemptState::Pending);
        assert_eq!(all["a2"].state, AttemptState::Committed);
        assert!(now > 0);
    }

    #[tokio::test]
    async fn test_read_all_entries_missing_shard() {
        let coll: Arc<dyn Collection> = Arc::new(MemoryCollection::new("app"));
        let repo = AtrRepository::new(coll);
        assert!(repo.read_all_entries("_txn:atr-77").await.unwrap().is_none());
    }
}
