//! Keel apply: write rendered objects to the store and keep scope membership in sync.
//!
//! Upserts are ownership-checked: an existing object is only patched when its
//! controller owner is the composition being applied. A failure aborts the rest
//! of the pass; objects written before it stay written and are re-applied
//! idempotently next time.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_core::model::{Composition, WorkloadStatus};
use keel_core::{DefinitionLookup, Document, ObjectKey, ObjectStore, TypedReference};
use keel_render::RenderedWorkload;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

pub mod gc;

pub use gc::eligible;

pub const DEFAULT_WORKLOAD_REF_PATH: &str = "spec.workloadRef";
pub const DEFAULT_WORKLOAD_REFS_PATH: &str = "spec.workloadRefs";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    /// Whether a merge patch of the target would change anything.
    pub fn is_noop(&self) -> bool { self.adds == 0 && self.updates == 0 }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub patched: usize,
    pub unchanged: usize,
    /// Objects held back by an unsatisfied data input.
    pub deferred: usize,
    pub scopes_bound: usize,
    pub scopes_unbound: usize,
}

pub struct Applicator<'a> {
    store: &'a dyn ObjectStore,
    definitions: &'a dyn DefinitionLookup,
}

impl<'a> Applicator<'a> {
    pub fn new(store: &'a dyn ObjectStore, definitions: &'a dyn DefinitionLookup) -> Self { Self { store, definitions } }

    /// Apply every rendered workload, its traits and scope bindings, then drop
    /// scope memberships the composition no longer declares.
    pub async fn apply(&self, comp: &Composition, workloads: &[RenderedWorkload]) -> Result<ApplySummary> {
        let t0 = Instant::now();
        let ns = comp.namespace();
        let mut sum = ApplySummary::default();
        for w in workloads {
            if w.has_dependency {
                sum.deferred += 1;
            } else {
                self.upsert(comp.uid(), &w.object, &mut sum).await?;
            }
            let wref = workload_ref(&w.object);
            for t in &w.traits {
                if t.has_dependency {
                    sum.deferred += 1;
                    continue;
                }
                let mut obj = t.object.clone();
                let path = t.definition.workload_ref_path.as_deref().unwrap_or(DEFAULT_WORKLOAD_REF_PATH);
                obj.set(path, serde_json::to_value(&wref)?)
                    .with_context(|| format!("stamping workload reference on {} {}", obj.kind(), obj.name()))?;
                self.upsert(comp.uid(), &obj, &mut sum).await?;
            }
            if w.has_dependency { continue; }
            for s in &w.scopes {
                let path = s.definition.workload_refs_path.as_deref().unwrap_or(DEFAULT_WORKLOAD_REFS_PATH);
                if self.bind_scope(&s.reference.key(ns), path, &wref).await? { sum.scopes_bound += 1; }
            }
        }
        sum.scopes_unbound = self.dereference(ns, &comp.status.workloads, workloads).await?;

        histogram!("keel_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            composition = %comp.name(),
            namespace = %ns,
            created = sum.created,
            patched = sum.patched,
            unchanged = sum.unchanged,
            deferred = sum.deferred,
            took_ms = %t0.elapsed().as_millis(),
            "apply complete"
        );
        Ok(sum)
    }

    /// Remove workloads recorded in `previous` from scopes they no longer belong to.
    /// A workload missing from `current` has left every scope.
    pub async fn dereference(&self, namespace: &str, previous: &[WorkloadStatus], current: &[RenderedWorkload]) -> Result<usize> {
        let mut removed = 0;
        for ws in previous {
            let still = current.iter().find(|w| w.reference().same_object(&ws.reference));
            for sc in &ws.scopes {
                let kept = still.map(|w| w.scopes.iter().any(|s| s.reference.same_object(&sc.reference))).unwrap_or(false);
                if kept { continue; }
                let def = self.definitions.scope_definition(&sc.reference.api_version, &sc.reference.kind).await?;
                let path = def.workload_refs_path.as_deref().unwrap_or(DEFAULT_WORKLOAD_REFS_PATH);
                if self.unbind_scope(&sc.reference.key(namespace), path, &ws.reference).await? { removed += 1; }
            }
        }
        Ok(removed)
    }

    /// Unbind every recorded workload from every recorded scope (finalization).
    pub async fn unbind_all(&self, namespace: &str, previous: &[WorkloadStatus]) -> Result<usize> {
        self.dereference(namespace, previous, &[]).await
    }

    async fn upsert(&self, owner_uid: &str, desired: &Document, sum: &mut ApplySummary) -> Result<()> {
        let key = desired.key();
        let live = self.store.get_opt(&key).await.with_context(|| format!("reading {} {}", key.kind, key.name))?;
        let Some(live) = live else {
            self.store.create(desired.clone()).await.with_context(|| format!("creating {} {}", key.kind, key.name))?;
            counter!("keel_apply_objects_total", 1u64, "op" => "create");
            debug!(object = %key, "created");
            sum.created += 1;
            return Ok(());
        };
        match live.controller_uid() {
            Some(uid) if uid == owner_uid => {}
            other => {
                return Err(anyhow!(
                    "cannot apply {} {}: existing object is controlled by {} not {}",
                    key.kind,
                    key.name,
                    other.as_deref().unwrap_or("nobody"),
                    owner_uid
                ))
            }
        }
        let body = strip_noisy(desired.as_json().clone());
        let diff = diff_summary(&body, &strip_noisy(live.as_json().clone()));
        if diff.is_noop() {
            sum.unchanged += 1;
            return Ok(());
        }
        self.store.patch(&key, &body).await.with_context(|| format!("patching {} {}", key.kind, key.name))?;
        counter!("keel_apply_objects_total", 1u64, "op" => "patch");
        debug!(object = %key, adds = diff.adds, updates = diff.updates, "patched");
        sum.patched += 1;
        Ok(())
    }

    /// Returns whether the scope was changed.
    async fn bind_scope(&self, key: &ObjectKey, path: &str, wref: &TypedReference) -> Result<bool> {
        let ctx = || format!("binding {} to {} {}", wref.name, key.kind, key.name);
        let mut scope = self.store.get(key).await.with_context(ctx)?;
        let mut refs = member_refs(&scope, path);
        if refs.iter().any(|r| r.same_object(wref)) { return Ok(false); }
        refs.push(wref.clone());
        scope.set(path, serde_json::to_value(&refs)?).with_context(ctx)?;
        self.store.update(scope).await.with_context(ctx)?;
        debug!(scope = %key, workload = %wref.name, "bound to scope");
        Ok(true)
    }

    async fn unbind_scope(&self, key: &ObjectKey, path: &str, wref: &TypedReference) -> Result<bool> {
        let ctx = || format!("unbinding {} from {} {}", wref.name, key.kind, key.name);
        let Some(mut scope) = self.store.get_opt(key).await.with_context(ctx)? else { return Ok(false) };
        let mut refs = member_refs(&scope, path);
        let before = refs.len();
        refs.retain(|r| !r.same_object(wref));
        if refs.len() == before { return Ok(false); }
        scope.set(path, serde_json::to_value(&refs)?).with_context(ctx)?;
        self.store.update(scope).await.with_context(ctx)?;
        debug!(scope = %key, workload = %wref.name, "unbound from scope");
        Ok(true)
    }
}

/// Reference stamped onto traits and scopes (no uid, so it is stable across re-creation).
pub fn workload_ref(obj: &Document) -> TypedReference {
    TypedReference { uid: String::new(), ..obj.typed_reference() }
}

fn member_refs(scope: &Document, path: &str) -> Vec<TypedReference> {
    scope.get(path).ok().and_then(|v| serde_json::from_value(v.clone()).ok()).unwrap_or_default()
}

/// Drop server-populated fields before comparing or patching.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "deletionTimestamp"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => if av != bv { s.updates += 1 },
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "x", "managedFields": [{}], "resourceVersion": "1", "generation": 5, "uid": "u"},
            "status": {"obs": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        assert_eq!(pruned, json!({"kind": "ConfigMap", "metadata": {"name": "x"}, "data": {"k": "v"}}));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        assert_eq!(diff_summary(&target, &base), DiffSummary { adds: 2, updates: 2, removes: 1 });
        // keys only on the live side never force a patch
        assert!(diff_summary(&json!({"a": 1}), &json!({"a": 1, "extra": 0})).is_noop());
    }
}
