//! Client record: the per-bucket registry of active cleanup clients
//!
//! Every process running lost-transaction cleanup heartbeats its presence
//! into one well-known document per bucket. From that document alone, every
//! client independently computes the same partition of the ATR shard space,
//! so all shards are scanned by exactly one client without any coordination
//! beyond CAS writes. Heartbeats are compared against the bucket's logical
//! clock, never local wall-clock, so clock skew between processes cannot
//! produce permanently contested or orphaned shards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorClass, Result};
use crate::store::{
    Cas, Collection, LookupSpec, MutateOptions, MutateSpec, StoreSemantics, HLC_PATH,
};

/// Well-known document id holding the client registry for a bucket.
pub const CLIENT_RECORD_DOC_ID: &str = "_txn:client-record";

const FIELD_RECORDS: &str = "records";
const FIELD_CLIENTS: &str = "records.clients";

/// Slack added to each client's declared cleanup window before other clients
/// may treat its heartbeat as expired.
pub const EXPIRES_SAFETY_MARGIN_MS: u64 = 20_000;

/// Sub-document operation budget for a single record update.
const MAX_SPECS_PER_UPDATE: usize = 16;

/// One client's row in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecordEntry {
    /// Last heartbeat, as the bucket logical clock value at write time.
    #[serde(rename = "hb")]
    pub heartbeat_ms: u64,
    /// This client's own expiry budget: declared cleanup window plus margin.
    #[serde(rename = "exp")]
    pub expires_ms: u64,
    /// Shard count the client was configured with.
    #[serde(rename = "atrs")]
    pub num_atrs: u32,
}

/// Parsed client registry document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(default)]
    pub clients: HashMap<String, ClientRecordEntry>,
}

/// Reads and writes one bucket's client record under CAS.
pub struct ClientRecordRepository {
    collection: Arc<dyn Collection>,
}

impl ClientRecordRepository {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self { collection }
    }

    /// Fetch the registry plus the bucket's logical clock. `None` when the
    /// record document (or its clients field) does not exist yet.
    pub async fn get(&self) -> Result<Option<(ClientRecord, u64, Cas)>> {
        let result = match self
            .collection
            .lookup_in(
                CLIENT_RECORD_DOC_ID,
                vec![LookupSpec::get(FIELD_RECORDS), LookupSpec::get(HLC_PATH)],
            )
            .await
        {
            Ok(result) => result,
            Err(e) if e.error_class() == ErrorClass::FailDocNotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let record: ClientRecord = match result.content(0) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => return Ok(None),
        };
        let now_hlc_ms = result.content(1).and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(Some((record, now_hlc_ms, result.cas)))
    }

    /// Create the registry document with an empty client map. A concurrent
    /// creation by another client surfaces as `DocumentExists`, which callers
    /// treat as success.
    pub async fn create_placeholder(&self) -> Result<()> {
        self.collection
            .mutate_in(
                CLIENT_RECORD_DOC_ID,
                vec![MutateSpec::Upsert {
                    path: FIELD_CLIENTS.to_string(),
                    value: Value::Object(Default::default()),
                }],
                MutateOptions::default().semantics(StoreSemantics::Insert),
            )
            .await?;
        Ok(())
    }

    /// Heartbeat this client and prune expired peers.
    ///
    /// The heartbeat is the store-assigned logical clock value (CAS macro),
    /// not a local timestamp. Expired peer entries are removed in the same
    /// mutation, capped by the per-operation spec budget; any remainder is
    /// pruned by a later cycle.
    pub async fn update(
        &self,
        client_uuid: &str,
        cleanup_window: Duration,
        num_atrs: u32,
        expired_client_ids: &[String],
    ) -> Result<()> {
        let prefix = format!("{}.{}", FIELD_CLIENTS, client_uuid);
        let mut specs = vec![
            MutateSpec::UpsertCasMacro {
                path: format!("{}.hb", prefix),
            },
            MutateSpec::Upsert {
                path: format!("{}.exp", prefix),
                value: Value::from(cleanup_window.as_millis() as u64 + EXPIRES_SAFETY_MARGIN_MS),
            },
            MutateSpec::Upsert {
                path: format!("{}.atrs", prefix),
                value: Value::from(num_atrs),
            },
        ];

        let removal_budget = MAX_SPECS_PER_UPDATE - specs.len();
        for expired in expired_client_ids.iter().take(removal_budget) {
            specs.push(MutateSpec::Remove {
                path: format!("{}.{}", FIELD_CLIENTS, expired),
            });
        }

        let outcome = self
            .collection
            .mutate_in(
                CLIENT_RECORD_DOC_ID,
                specs.clone(),
                MutateOptions::default().semantics(StoreSemantics::Upsert),
            )
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) if e.error_class() == ErrorClass::FailPathNotFound => {
                // Another client pruned one of the expired entries first.
                // Heartbeat again without the removals.
                specs.truncate(3);
                self.collection
                    .mutate_in(
                        CLIENT_RECORD_DOC_ID,
                        specs,
                        MutateOptions::default().semantics(StoreSemantics::Upsert),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove this client's entry. Missing document or entry means a peer
    /// already pruned it.
    pub async fn remove(&self, client_uuid: &str) -> Result<()> {
        let outcome = self
            .collection
            .mutate_in(
                CLIENT_RECORD_DOC_ID,
                vec![MutateSpec::Remove {
                    path: format!("{}.{}", FIELD_CLIENTS, client_uuid),
                }],
                MutateOptions::default(),
            )
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) if e.is_converged_signal() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove with jittered exponential backoff, for shutdown paths where
    /// leaving a stale entry would stall shard handover for a full window.
    pub async fn remove_with_retry(&self, client_uuid: &str) {
        for retry in 1u32.. {
            match self.remove(client_uuid).await {
                Ok(()) => {
                    log::debug!("Removed client record entry for {}", client_uuid);
                    return;
                }
                Err(e) => {
                    let delay_ms = (1u64 << retry) + rand::thread_rng().gen_range(0..10);
                    if delay_ms > 250 {
                        log::warn!(
                            "Giving up removing client record entry for {}: {}",
                            client_uuid,
                            e
                        );
                        return;
                    }
                    log::debug!(
                        "Retrying client record removal for {} in {}ms: {}",
                        client_uuid,
                        delay_ms,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

/// The shard-ownership view computed from one read of the client record.
///
/// A pure function of (registry contents, bucket clock, this client's id and
/// window): every client computes the same active set and therefore the same
/// partition, with no communication beyond the record itself.
#[derive(Debug, Clone)]
pub struct ClientRecordDetails {
    /// Sorted ids of clients whose heartbeat is within budget, self included.
    pub active_client_ids: Vec<String>,
    /// Ids whose heartbeat is older than their own declared budget.
    pub expired_client_ids: Vec<String>,
    /// This client's position within `active_client_ids`.
    pub index_of_this_client: usize,
    /// ATR shard indexes owned by this client.
    pub atr_indexes: Vec<u32>,
    /// Pacing delay between ATR scans so one pass spreads over the window.
    pub check_atr_time_window: Duration,
}

impl ClientRecordDetails {
    pub fn new(
        record: &ClientRecord,
        now_hlc_ms: u64,
        this_client: &str,
        cleanup_window: Duration,
        num_atrs: u32,
    ) -> Self {
        let mut active_client_ids = Vec::new();
        let mut expired_client_ids = Vec::new();

        for (id, entry) in &record.clients {
            // Each entry expires on its own declared budget, so a client with
            // a longer window than ours is never evicted prematurely.
            let deadline = entry.heartbeat_ms.saturating_add(entry.expires_ms);
            if id != this_client && deadline < now_hlc_ms {
                expired_client_ids.push(id.clone());
            } else {
                active_client_ids.push(id.clone());
            }
        }

        // This client is about to heartbeat, so it is active even if its
        // entry is missing or stale.
        if !active_client_ids.iter().any(|id| id == this_client) {
            active_client_ids.push(this_client.to_string());
        }

        active_client_ids.sort();
        expired_client_ids.sort();

        let index_of_this_client = active_client_ids
            .iter()
            .position(|id| id == this_client)
            .expect("this client inserted above");

        let num_active = active_client_ids.len() as u32;
        let atr_indexes: Vec<u32> = (0..num_atrs)
            .filter(|shard| shard % num_active == index_of_this_client as u32)
            .collect();

        let check_atr_time_window = if atr_indexes.is_empty() {
            cleanup_window
        } else {
            cleanup_window / atr_indexes.len() as u32
        };

        Self {
            active_client_ids,
            expired_client_ids,
            index_of_this_client,
            atr_indexes,
            check_atr_time_window,
        }
    }
}
