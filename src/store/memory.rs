//! In-memory store backend
//!
//! A complete in-process implementation of the collection operations with
//! real CAS and logical-clock behavior: every mutation bumps a per-bucket
//! monotonic HLC, CAS preconditions are enforced, and sub-document paths are
//! navigated within JSON documents. Integration tests run against this
//! backend; it is also a reference for what Keystone expects of a real store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Cas, Cluster, Collection, Durability, GetResult, LookupResult, LookupSpec, MutateOptions,
    MutateSpec, StoreSemantics, HLC_PATH,
};
use crate::error::{KeystoneError, Result};

struct StoredDoc {
    content: Value,
    cas: Cas,
}

/// One in-memory collection (one per bucket in this backend).
pub struct MemoryCollection {
    bucket: String,
    name: String,
    docs: Mutex<HashMap<String, StoredDoc>>,
    /// Bucket logical clock: max(wall-clock ms, last + 1) on every tick.
    hlc: AtomicU64,
}

impl MemoryCollection {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: "_default".to_string(),
            docs: Mutex::new(HashMap::new()),
            hlc: AtomicU64::new(0),
        }
    }

    /// Advance and return the bucket HLC. Strictly monotonic even when the
    /// wall clock stalls or steps backwards.
    fn tick_hlc(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut current = self.hlc.load(Ordering::Acquire);
        loop {
            let next = wall.max(current + 1);
            match self.hlc.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(c) => current = c,
            }
        }
    }

    /// Number of documents currently stored. Test observability.
    pub fn doc_count(&self) -> usize {
        self.docs.lock().expect("docs lock poisoned").len()
    }

    fn check_cas(key: &str, doc: &StoredDoc, cas: Cas) -> Result<()> {
        if cas != 0 && doc.cas != cas {
            return Err(KeystoneError::CasMismatch(key.to_string()));
        }
        Ok(())
    }
}

/// Walk `path` ("a.b.c") within `root`, returning the value if present.
fn json_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Walk to the parent object of `path`, creating intermediate objects when
/// `create` is set. Returns the parent map and the leaf key.
fn json_parent<'a>(
    root: &'a mut Value,
    path: &str,
    create: bool,
) -> Result<(&'a mut serde_json::Map<String, Value>, String)> {
    let segments: Vec<&str> = path.split('.').collect();
    let (leaf, parents) = segments.split_last().expect("path is never empty");

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            return Err(KeystoneError::PathNotFound(path.to_string()));
        }
        let map = current.as_object_mut().expect("checked is_object above");
        if !map.contains_key(*segment) {
            if !create {
                return Err(KeystoneError::PathNotFound(path.to_string()));
            }
            map.insert(segment.to_string(), Value::Object(Default::default()));
        }
        current = map.get_mut(*segment).expect("inserted above");
    }

    match current.as_object_mut() {
        Some(map) => Ok((map, leaf.to_string())),
        None => Err(KeystoneError::PathNotFound(path.to_string())),
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<GetResult> {
        let docs = self.docs.lock().expect("docs lock poisoned");
        match docs.get(key) {
            Some(doc) => Ok(GetResult {
                content: doc.content.clone(),
                cas: doc.cas,
            }),
            None => Err(KeystoneError::DocumentNotFound(key.to_string())),
        }
    }

    async fn insert(&self, key: &str, content: Value, _durability: Durability) -> Result<Cas> {
        let mut docs = self.docs.lock().expect("docs lock poisoned");
        if docs.contains_key(key) {
            return Err(KeystoneError::DocumentExists(key.to_string()));
        }
        let cas = self.tick_hlc();
        docs.insert(key.to_string(), StoredDoc { content, cas });
        Ok(cas)
    }

    async fn replace(
        &self,
        key: &str,
        content: Value,
        cas: Cas,
        _durability: Durability,
    ) -> Result<Cas> {
        let mut docs = self.docs.lock().expect("docs lock poisoned");
        let doc = docs
            .get_mut(key)
            .ok_or_else(|| KeystoneError::DocumentNotFound(key.to_string()))?;
        MemoryCollection::check_cas(key, doc, cas)?;
        doc.content = content;
        doc.cas = self.tick_hlc();
        Ok(doc.cas)
    }

    async fn remove(&self, key: &str, cas: Cas, _durability: Durability) -> Result<()> {
        let mut docs = self.docs.lock().expect("docs lock poisoned");
        let doc = docs
            .get(key)
            .ok_or_else(|| KeystoneError::DocumentNotFound(key.to_string()))?;
        MemoryCollection::check_cas(key, doc, cas)?;
        docs.remove(key);
        Ok(())
    }

    async fn mutate_in(
        &self,
        key: &str,
        specs: Vec<MutateSpec>,
        opts: MutateOptions,
    ) -> Result<Cas> {
        let mut docs = self.docs.lock().expect("docs lock poisoned");

        match opts.semantics {
            StoreSemantics::Insert => {
                if docs.contains_key(key) {
                    return Err(KeystoneError::DocumentExists(key.to_string()));
                }
                let cas = self.tick_hlc();
                docs.insert(
                    key.to_string(),
                    StoredDoc {
                        content: Value::Object(Default::default()),
                        cas,
                    },
                );
            }
            StoreSemantics::Upsert => {
                if !docs.contains_key(key) {
                    let cas = self.tick_hlc();
                    docs.insert(
                        key.to_string(),
                        StoredDoc {
                            content: Value::Object(Default::default()),
                            cas,
                        },
                    );
                }
            }
            StoreSemantics::Replace => {
                if !docs.contains_key(key) {
                    return Err(KeystoneError::DocumentNotFound(key.to_string()));
                }
            }
        }

        let doc = docs.get_mut(key).expect("ensured above");
        MemoryCollection::check_cas(key, doc, opts.cas)?;

        // Apply all specs against a copy so a failing spec leaves the
        // document untouched, then commit atomically.
        let mut content = doc.content.clone();
        for spec in &specs {
            match spec {
                MutateSpec::Insert { path, value } => {
                    let (parent, leaf) = json_parent(&mut content, path, true)?;
                    if parent.contains_key(&leaf) {
                        return Err(KeystoneError::PathExists(path.clone()));
                    }
                    parent.insert(leaf, value.clone());
                }
                MutateSpec::Upsert { path, value } => {
                    let (parent, leaf) = json_parent(&mut content, path, true)?;
                    parent.insert(leaf, value.clone());
                }
                MutateSpec::UpsertCasMacro { path } => {
                    let hlc = self.tick_hlc();
                    let (parent, leaf) = json_parent(&mut content, path, true)?;
                    parent.insert(leaf, Value::from(hlc));
                }
                MutateSpec::Remove { path } => {
                    let (parent, leaf) = json_parent(&mut content, path, false)?;
                    if parent.remove(&leaf).is_none() {
                        return Err(KeystoneError::PathNotFound(path.clone()));
                    }
                }
            }
        }

        doc.content = content;
        doc.cas = self.tick_hlc();
        Ok(doc.cas)
    }

    async fn lookup_in(&self, key: &str, specs: Vec<LookupSpec>) -> Result<LookupResult> {
        let docs = self.docs.lock().expect("docs lock poisoned");
        let doc = docs
            .get(key)
            .ok_or_else(|| KeystoneError::DocumentNotFound(key.to_string()))?;

        let mut values = Vec::with_capacity(specs.len());
        for spec in &specs {
            let LookupSpec::Get { path } = spec;
            if path == HLC_PATH {
                values.push(Some(Value::from(self.tick_hlc())));
            } else {
                values.push(json_get(&doc.content, path).cloned());
            }
        }

        Ok(LookupResult::new(doc.cas, values))
    }
}

/// An in-memory cluster: a set of named buckets, one collection each.
pub struct MemoryCluster {
    buckets: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or fetch) a bucket and return its collection.
    pub fn add_bucket(&self, name: impl Into<String>) -> Arc<MemoryCollection> {
        let name = name.into();
        let mut buckets = self.buckets.lock().expect("buckets lock poisoned");
        Arc::clone(
            buckets
                .entry(name.clone())
                .or_insert_with(|| Arc::new(MemoryCollection::new(name))),
        )
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster for MemoryCluster {
    fn bucket_names(&self) -> Vec<String> {
        let buckets = self.buckets.lock().expect("buckets lock poisoned");
        let mut names: Vec<String> = buckets.keys().cloned().collect();
        names.sort();
        names
    }

    fn collection(&self, bucket: &str) -> Option<Arc<dyn Collection>> {
        let buckets = self.buckets.lock().expect("buckets lock poisoned");
        buckets
            .get(bucket)
            .map(|c| Arc::clone(c) as Arc<dyn Collection>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let coll = MemoryCollection::new("app");
        let cas = coll
            .insert("k1", json!({"v": 1}), Durability::None)
            .await
            .unwrap();
        assert!(cas > 0);

        let got = coll.get("k1").await.unwrap();
        assert_eq!(got.content, json!({"v": 1}));
        assert_eq!(got.cas, cas);
    }

    #[tokio::test]
    async fn test_insert_collision() {
        let coll = MemoryCollection::new("app");
        coll.insert("k1", json!({}), Durability::None).await.unwrap();
        let err = coll.insert("k1", json!({}), Durability::None).await.unwrap_err();
        assert!(matches!(err, KeystoneError::DocumentExists(_)));
    }

    #[tokio::test]
    async fn test_replace_enforces_cas() {
        let coll = MemoryCollection::new("app");
        let cas = coll.insert("k1", json!({"v": 1}), Durability::None).await.unwrap();

        let err = coll
            .replace("k1", json!({"v": 2}), cas + 999, Durability::None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoneError::CasMismatch(_)));

        let new_cas = coll
            .replace("k1", json!({"v": 2}), cas, Durability::None)
            .await
            .unwrap();
        assert!(new_cas > cas);
    }

    #[tokio::test]
    async fn test_remove_enforces_cas() {
        let coll = MemoryCollection::new("app");
        let cas = coll.insert("k1", json!({}), Durability::None).await.unwrap();

        let err = coll.remove("k1", cas + 1, Durability::None).await.unwrap_err();
        assert!(matches!(err, KeystoneError::CasMismatch(_)));

        coll.remove("k1", cas, Durability::None).await.unwrap();
        let err = coll.get("k1").await.unwrap_err();
        assert!(matches!(err, KeystoneError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_mutate_in_paths() {
        let coll = MemoryCollection::new("app");
        coll.mutate_in(
            "doc",
            vec![MutateSpec::Upsert {
                path: "attempts.a1.st".to_string(),
                value: json!("PENDING"),
            }],
            MutateOptions::default().semantics(StoreSemantics::Upsert),
        )
        .await
        .unwrap();

        let got = coll.get("doc").await.unwrap();
        assert_eq!(got.content, json!({"attempts": {"a1": {"st": "PENDING"}}}));

        coll.mutate_in(
            "doc",
            vec![MutateSpec::Remove {
                path: "attempts.a1".to_string(),
            }],
            MutateOptions::default(),
        )
        .await
        .unwrap();

        let got = coll.get("doc").await.unwrap();
        assert_eq!(got.content, json!({"attempts": {}}));
    }

    #[tokio::test]
    async fn test_mutate_in_insert_spec_fails_on_existing_path() {
        let coll = MemoryCollection::new("app");
        coll.mutate_in(
            "doc",
            vec![MutateSpec::Insert {
                path: "a.b".to_string(),
                value: json!(1),
            }],
            MutateOptions::default().semantics(StoreSemantics::Upsert),
        )
        .await
        .unwrap();

        let err = coll
            .mutate_in(
                "doc",
                vec![MutateSpec::Insert {
                    path: "a.b".to_string(),
                    value: json!(2),
                }],
                MutateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoneError::PathExists(_)));
    }

    #[tokio::test]
    async fn test_failed_spec_leaves_document_untouched() {
        let coll = MemoryCollection::new("app");
        coll.insert("doc", json!({"a": 1}), Durability::None).await.unwrap();

        let err = coll
            .mutate_in(
                "doc",
                vec![
                    MutateSpec::Upsert {
                        path: "b".to_string(),
                        value: json!(2),
                    },
                    MutateSpec::Remove {
                        path: "missing".to_string(),
                    },
                ],
                MutateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoneError::PathNotFound(_)));

        // First spec must not have been applied
        let got = coll.get("doc").await.unwrap();
        assert_eq!(got.content, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_lookup_in_hlc_is_monotonic() {
        let coll = MemoryCollection::new("app");
        coll.insert("doc", json!({}), Durability::None).await.unwrap();

        let r1 = coll
            .lookup_in("doc", vec![LookupSpec::get(HLC_PATH)])
            .await
            .unwrap();
        let r2 = coll
            .lookup_in("doc", vec![LookupSpec::get(HLC_PATH)])
            .await
            .unwrap();

        let t1 = r1.content(0).unwrap().as_u64().unwrap();
        let t2 = r2.content(0).unwrap().as_u64().unwrap();
        assert!(t2 > t1);
    }

    #[tokio::test]
    async fn test_cas_macro_stores_clock_value() {
        let coll = MemoryCollection::new("app");
        coll.mutate_in(
            "rec",
            vec![MutateSpec::UpsertCasMacro {
                path: "clients.c1.hb".to_string(),
            }],
            MutateOptions::default().semantics(StoreSemantics::Upsert),
        )
        .await
        .unwrap();

        let got = coll.get("rec").await.unwrap();
        let hb = json_get(&got.content, "clients.c1.hb").unwrap().as_u64().unwrap();
        assert!(hb > 0);
    }

    #[test]
    fn test_cluster_bucket_discovery() {
        let cluster = MemoryCluster::new();
        cluster.add_bucket("beta");
        cluster.add_bucket("alpha");

        assert_eq!(cluster.bucket_names(), vec!["alpha", "beta"]);
        assert!(cluster.collection("alpha").is_some());
        assert!(cluster.collection("gamma").is_none());
    }
}
