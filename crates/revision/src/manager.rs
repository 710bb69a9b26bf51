//! Snapshot a component whenever its spec moves away from the latest revision.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::model::{Component, ComponentStatus, Revision};
use keel_core::{ObjectKey, ObjectStore, RevisionSnapshot, RevisionStore};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::naming::construct_revision_name;

pub struct RevisionManager {
    store: Arc<dyn ObjectStore>,
    revisions: Arc<dyn RevisionStore>,
    limit: usize,
}

impl RevisionManager {
    pub fn new(store: Arc<dyn ObjectStore>, revisions: Arc<dyn RevisionStore>, limit: usize) -> Self {
        Self { store, revisions, limit }
    }

    /// Handle a create/update of the component at `key`. Returns the new
    /// revision if one was minted; `None` when its spec is unchanged or the
    /// component is gone.
    pub async fn on_component_changed(&self, key: &ObjectKey) -> Result<Option<Revision>> {
        let t0 = Instant::now();
        let Some(doc) = self.store.get_opt(key).await.with_context(|| format!("reading component {}", key.name))? else {
            debug!(component = %key.name, "component gone; nothing to snapshot");
            return Ok(None);
        };
        let component: Component = doc.decode().with_context(|| format!("decoding component {}", key.name))?;
        let latest = component.status.latest_revision.clone();

        if let Some(prev) = &latest {
            match self.revisions.get(&key.namespace, &prev.name).await {
                Ok(Some(snap)) if snap.component.spec == component.spec => return Ok(None),
                Ok(_) => {}
                Err(e) => warn!(component = %key.name, revision = %prev.name, error = %e, "latest revision unreadable; minting a new one"),
            }
        }

        let number = latest.as_ref().map(|r| r.revision).unwrap_or(0) + 1;
        let name = construct_revision_name(component.name());
        let snapshot = RevisionSnapshot {
            name: name.clone(),
            namespace: key.namespace.clone(),
            component_name: component.name().to_string(),
            revision: number,
            component: snapshot_of(&component),
        };
        let (name, number) = self.revisions.put(&snapshot).await.with_context(|| format!("storing revision {}", name))?;

        let revision = Revision { name: name.clone(), revision: number };
        let mut updated = doc.clone();
        updated.set("status.latestRevision", serde_json::to_value(&revision)?)?;
        self.store.update_status(updated).await.with_context(|| format!("updating status of component {}", key.name))?;

        let pruned = self.revisions.prune(&key.namespace, component.name(), self.limit).await.with_context(|| format!("pruning revisions of {}", key.name))?;
        counter!("keel_revisions_created_total", 1u64);
        histogram!("keel_revision_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(component = %key.name, namespace = %key.namespace, revision = %name, number, pruned, took_ms = %t0.elapsed().as_millis(), "revision created");
        Ok(Some(revision))
    }
}

/// Spec plus identifying metadata; status and server bookkeeping are dropped.
fn snapshot_of(c: &Component) -> Component {
    Component {
        api_version: c.api_version.clone(),
        kind: c.kind.clone(),
        metadata: ObjectMeta {
            name: c.metadata.name.clone(),
            namespace: c.metadata.namespace.clone(),
            uid: c.metadata.uid.clone(),
            labels: c.metadata.labels.clone(),
            annotations: c.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: c.spec.clone(),
        status: ComponentStatus::default(),
    }
}

