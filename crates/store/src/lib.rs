//! Keel store: in-RAM implementation of the declarative object store.
//!
//! Writers serialize on a mutex and publish an immutable snapshot through
//! `ArcSwap`. `snapshot`, `len` and `objects_of` read it lock-free; `get`
//! and `list` briefly take the writer mutex to consume injected failures.
//! Semantics follow the API server closely enough for the engine: resource
//! versions, status sub-resource, finalizers and owner-reference cascading
//! deletion.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use keel_core::{Document, LabelSelector, ObjectKey, ObjectStore, StoreError};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as Json};
use tokio::sync::watch;
use tracing::debug;

type World = FxHashMap<ObjectKey, Document>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb { Get, List, Create, Update, UpdateStatus, Patch, Delete }

struct Inner {
    objects: World,
    next_rv: u64,
    epoch: u64,
    failures: FxHashMap<(Verb, ObjectKey), StoreError>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
    snap: ArcSwap<World>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl MemStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner { objects: World::default(), next_rv: 1, epoch: 0, failures: FxHashMap::default() }),
            snap: ArcSwap::from_pointee(World::default()),
            epoch_tx,
        }
    }

    /// Current immutable view of every object.
    pub fn snapshot(&self) -> Arc<FxHashMap<ObjectKey, Document>> { self.snap.load_full() }

    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// All objects of one kind, sorted by namespace/name.
    pub fn objects_of(&self, kind: &str) -> Vec<Document> {
        let snap = self.snap.load();
        let mut out: Vec<Document> = snap.values().filter(|d| d.kind() == kind).cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Bumped after every successful write.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// Make the next `verb` on `key` fail with `err` (one shot).
    pub fn fail_next(&self, verb: Verb, key: ObjectKey, err: StoreError) {
        self.lock().failures.insert((verb, key), err);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a panicked writer leaves the map consistent (every write is a single insert/remove)
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn injected(inner: &mut Inner, verb: Verb, key: &ObjectKey) -> Result<(), StoreError> {
        match inner.failures.remove(&(verb, key.clone())) { Some(e) => Err(e), None => Ok(()) }
    }

    fn publish(&self, inner: &mut Inner) {
        inner.epoch = inner.epoch.saturating_add(1);
        self.snap.store(Arc::new(inner.objects.clone()));
        self.epoch_tx.send_replace(inner.epoch);
    }

    fn stamp_rv(inner: &mut Inner, doc: &mut Document) {
        let rv = inner.next_rv;
        inner.next_rv += 1;
        let _ = doc.set_string("metadata.resourceVersion", &rv.to_string());
    }

    fn check_rv(current: &Document, incoming: &Document, key: &ObjectKey) -> Result<(), StoreError> {
        let rv = incoming.resource_version();
        if !rv.is_empty() && rv != current.resource_version() {
            return Err(StoreError::Conflict(format!("{}: resourceVersion {} is stale (current {})", key, rv, current.resource_version())));
        }
        Ok(())
    }

    fn remove_cascading(inner: &mut Inner, key: &ObjectKey) {
        let Some(gone) = inner.objects.remove(key) else { return };
        let uid = gone.uid().to_string();
        if uid.is_empty() { return; }
        let dependents: Vec<ObjectKey> = inner
            .objects
            .iter()
            .filter(|(_, d)| d.owner_references().iter().any(|o| o.uid == uid))
            .map(|(k, _)| k.clone())
            .collect();
        for k in dependents {
            debug!(owner = %key, dependent = %k, "cascading delete");
            Self::remove_cascading(inner, &k);
        }
    }
}

/// Everything except metadata and status; generation moves when this changes.
fn spec_part(doc: &Document) -> Json {
    match doc.as_json() {
        Json::Object(m) => Json::Object(m.iter().filter(|(k, _)| *k != "metadata" && *k != "status").map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => other.clone(),
    }
}

/// RFC 7386 merge patch: `null` removes a key, objects merge recursively.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() { *target = Json::Object(Map::new()); }
    if let Json::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Document, StoreError> {
        Self::injected(&mut self.lock(), Verb::Get, key)?;
        self.snap.load().get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: &str, selector: &LabelSelector) -> Result<Vec<Document>, StoreError> {
        Self::injected(&mut self.lock(), Verb::List, &ObjectKey::new(api_version, kind, namespace, ""))?;
        let snap = self.snap.load();
        let mut out: Vec<Document> = snap
            .iter()
            .filter(|(k, _)| k.api_version == api_version && k.kind == kind && (namespace.is_empty() || k.namespace == namespace))
            .filter(|(_, d)| selector.matches(&d.labels()))
            .map(|(_, d)| d.clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn create(&self, mut obj: Document) -> Result<Document, StoreError> {
        let key = obj.key();
        if key.name.is_empty() || key.kind.is_empty() || key.api_version.is_empty() {
            return Err(StoreError::Invalid(format!("create requires apiVersion, kind and metadata.name (got {})", key)));
        }
        let mut inner = self.lock();
        Self::injected(&mut inner, Verb::Create, &key)?;
        if inner.objects.contains_key(&key) { return Err(StoreError::AlreadyExists(key.to_string())); }
        let _ = obj.set_string("metadata.uid", &uuid::Uuid::new_v4().to_string());
        let _ = obj.set("metadata.generation", Json::from(1));
        let _ = obj.set_string("metadata.creationTimestamp", &chrono::Utc::now().to_rfc3339());
        Self::stamp_rv(&mut inner, &mut obj);
        inner.objects.insert(key.clone(), obj.clone());
        self.publish(&mut inner);
        debug!(key = %key, "created");
        Ok(obj)
    }

    async fn update(&self, mut obj: Document) -> Result<Document, StoreError> {
        let key = obj.key();
        let mut inner = self.lock();
        Self::injected(&mut inner, Verb::Update, &key)?;
        let current = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_rv(&current, &obj, &key)?;
        for field in ["metadata.uid", "metadata.creationTimestamp", "metadata.deletionTimestamp"] {
            match current.get(field) {
                Ok(v) => { let _ = obj.set(field, v.clone()); }
                Err(_) => { let _ = obj.remove(field); }
            }
        }
        match current.get("status") {
            Ok(st) => { let _ = obj.set("status", st.clone()); }
            Err(_) => { let _ = obj.remove("status"); }
        }
        let generation = current.generation() + i64::from(spec_part(&current) != spec_part(&obj));
        let _ = obj.set("metadata.generation", Json::from(generation));
        if obj.is_deleting() && obj.finalizers().is_empty() {
            Self::remove_cascading(&mut inner, &key);
            self.publish(&mut inner);
            debug!(key = %key, "finalizers cleared; removed");
            return Ok(obj);
        }
        Self::stamp_rv(&mut inner, &mut obj);
        inner.objects.insert(key, obj.clone());
        self.publish(&mut inner);
        Ok(obj)
    }

    async fn update_status(&self, obj: Document) -> Result<Document, StoreError> {
        let key = obj.key();
        let mut inner = self.lock();
        Self::injected(&mut inner, Verb::UpdateStatus, &key)?;
        let mut current = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_rv(&current, &obj, &key)?;
        match obj.get("status") {
            Ok(st) => { let _ = current.set("status", st.clone()); }
            Err(_) => { let _ = current.remove("status"); }
        }
        Self::stamp_rv(&mut inner, &mut current);
        inner.objects.insert(key, current.clone());
        self.publish(&mut inner);
        Ok(current)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        Self::injected(&mut inner, Verb::Patch, key)?;
        let current = inner.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let mut merged = current.as_json().clone();
        let mut body = patch.clone();
        if let Json::Object(m) = &mut body { m.remove("status"); }
        merge_patch(&mut merged, &body);
        let mut doc = Document::from_json(merged).map_err(|e| StoreError::Invalid(e.to_string()))?;
        if doc.key() != *key { return Err(StoreError::Invalid(format!("patch may not change identity of {}", key))); }
        let generation = current.generation() + i64::from(spec_part(&current) != spec_part(&doc));
        let _ = doc.set("metadata.generation", Json::from(generation));
        Self::stamp_rv(&mut inner, &mut doc);
        inner.objects.insert(key.clone(), doc.clone());
        self.publish(&mut inner);
        Ok(doc)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::injected(&mut inner, Verb::Delete, key)?;
        let current = inner.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if current.finalizers().is_empty() {
            Self::remove_cascading(&mut inner, key);
        } else if !current.is_deleting() {
            let mut marked = current;
            let _ = marked.set_string("metadata.deletionTimestamp", &chrono::Utc::now().to_rfc3339());
            Self::stamp_rv(&mut inner, &mut marked);
            inner.objects.insert(key.clone(), marked);
        }
        self.publish(&mut inner);
        debug!(key = %key, "delete");
        Ok(())
    }
}
