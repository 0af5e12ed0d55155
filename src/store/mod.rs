//! Collection operations consumed by the transaction engine
//!
//! Keystone talks to the underlying distributed key-value store through this
//! narrow interface: full-document get/insert/replace/remove plus
//! sub-document mutate/lookup, each with a durability requirement and a CAS
//! precondition. The wire protocol, connection pooling and retry policy live
//! behind implementations of these traits and are not part of this crate.
//!
//! The [`memory`] submodule provides a complete in-process implementation
//! with real CAS and logical-clock semantics, used by the integration tests.

pub mod memory;

pub use memory::{MemoryCluster, MemoryCollection};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Compare-and-swap token. 0 means "no precondition".
pub type Cas = u64;

/// Virtual lookup path resolving to the bucket's logical clock (HLC).
///
/// Cross-process heartbeat comparisons use this value, never local
/// wall-clock, so clock skew between client processes cannot skew shard
/// ownership decisions.
pub const HLC_PATH: &str = "$vbucket.hlc";

/// Durability requirement attached to every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Majority
    }
}

/// One sub-document mutation operation.
#[derive(Debug, Clone)]
pub enum MutateSpec {
    /// Insert at `path`; fails with PathExists if the leaf already exists.
    Insert { path: String, value: Value },
    /// Create or overwrite at `path`, creating intermediate objects.
    Upsert { path: String, value: Value },
    /// Store the bucket's current logical clock value at `path`.
    /// Used for client-record heartbeats.
    UpsertCasMacro { path: String },
    /// Remove the value at `path`; fails with PathNotFound if absent.
    Remove { path: String },
}

/// One sub-document lookup operation.
#[derive(Debug, Clone)]
pub enum LookupSpec {
    Get { path: String },
}

impl LookupSpec {
    pub fn get(path: impl Into<String>) -> Self {
        LookupSpec::Get { path: path.into() }
    }
}

/// Document-level semantics for a `mutate_in` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSemantics {
    /// The document must already exist (default).
    Replace,
    /// The document must not exist; it is created.
    Insert,
    /// The document is created if missing.
    Upsert,
}

/// Options for a `mutate_in` call.
#[derive(Debug, Clone)]
pub struct MutateOptions {
    pub cas: Cas,
    pub durability: Durability,
    pub semantics: StoreSemantics,
}

impl Default for MutateOptions {
    fn default() -> Self {
        Self {
            cas: 0,
            durability: Durability::None,
            semantics: StoreSemantics::Replace,
        }
    }
}

impl MutateOptions {
    pub fn cas(mut self, cas: Cas) -> Self {
        self.cas = cas;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn semantics(mut self, semantics: StoreSemantics) -> Self {
        self.semantics = semantics;
        self
    }
}

/// Result of a full-document get.
#[derive(Debug, Clone)]
pub struct GetResult {
    pub content: Value,
    pub cas: Cas,
}

/// Result of a sub-document lookup: one slot per requested spec.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub cas: Cas,
    values: Vec<Option<Value>>,
}

impl LookupResult {
    pub fn new(cas: Cas, values: Vec<Option<Value>>) -> Self {
        Self { cas, values }
    }

    /// Whether the path at `index` existed.
    pub fn exists(&self, index: usize) -> bool {
        self.values.get(index).map(|v| v.is_some()).unwrap_or(false)
    }

    /// The value at `index`, if the path existed.
    pub fn content(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|v| v.as_ref())
    }
}

/// One collection of documents within a bucket.
///
/// Every call surfaces either success, `CasMismatch`, `DocumentNotFound` /
/// `DocumentExists`, or a generic store failure to be classified by the
/// caller.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Name of the bucket holding this collection.
    fn bucket(&self) -> &str;

    /// Collection name within the bucket.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<GetResult>;

    async fn insert(&self, key: &str, content: Value, durability: Durability) -> Result<Cas>;

    async fn replace(
        &self,
        key: &str,
        content: Value,
        cas: Cas,
        durability: Durability,
    ) -> Result<Cas>;

    async fn remove(&self, key: &str, cas: Cas, durability: Durability) -> Result<()>;

    async fn mutate_in(
        &self,
        key: &str,
        specs: Vec<MutateSpec>,
        opts: MutateOptions,
    ) -> Result<Cas>;

    async fn lookup_in(&self, key: &str, specs: Vec<LookupSpec>) -> Result<LookupResult>;
}

/// Access to the buckets reachable from the current session.
pub trait Cluster: Send + Sync {
    /// Names of all currently known buckets.
    fn bucket_names(&self) -> Vec<String>;

    /// The collection for `bucket`, if the bucket exists.
    fn collection(&self, bucket: &str) -> Option<Arc<dyn Collection>>;
}
