//! Revision snapshots kept as `apps/v1 ControllerRevision` objects in the
//! declarative store, owned by their Component so they go away with it.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::model::Component;
use keel_core::{Document, LabelSelector, ObjectKey, ObjectStore, RevisionSnapshot, RevisionStore, StoreError, LABEL_CONTROLLER_COMPONENT};
use serde_json::json;

pub const REVISION_API_VERSION: &str = "apps/v1";
pub const REVISION_KIND: &str = "ControllerRevision";

pub struct StoreRevisionStore {
    store: Arc<dyn ObjectStore>,
}

impl StoreRevisionStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }

    fn key(namespace: &str, name: &str) -> ObjectKey { ObjectKey::new(REVISION_API_VERSION, REVISION_KIND, namespace, name) }
}

fn decode(doc: &Document) -> Result<RevisionSnapshot, StoreError> {
    let component: Component = doc
        .get("data")
        .ok()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .ok_or_else(|| StoreError::Invalid(format!("revision {} carries no component snapshot", doc.name())))?;
    Ok(RevisionSnapshot {
        name: doc.name().to_string(),
        namespace: doc.namespace().to_string(),
        component_name: doc.labels().get(LABEL_CONTROLLER_COMPONENT).cloned().unwrap_or_else(|| component.name().to_string()),
        revision: doc.get("revision").ok().and_then(|v| v.as_i64()).unwrap_or(0),
        component,
    })
}

#[async_trait]
impl RevisionStore for StoreRevisionStore {
    async fn put(&self, s: &RevisionSnapshot) -> Result<(String, i64), StoreError> {
        let data = serde_json::to_value(&s.component).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut doc = Document::from_json(json!({
            "apiVersion": REVISION_API_VERSION,
            "kind": REVISION_KIND,
            "metadata": {"name": s.name, "namespace": s.namespace},
            "revision": s.revision,
            "data": data,
        }))
        .map_err(|e| StoreError::Invalid(e.to_string()))?;
        doc.set_label(LABEL_CONTROLLER_COMPONENT, &s.component_name);
        if let Some(uid) = s.component.metadata.uid.as_deref().filter(|u| !u.is_empty()) {
            doc.set_controller(&OwnerReference {
                api_version: s.component.api_version.clone(),
                kind: s.component.kind.clone(),
                name: s.component_name.clone(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            });
        }
        self.store.create(doc).await?;
        Ok((s.name.clone(), s.revision))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<RevisionSnapshot>, StoreError> {
        match self.store.get_opt(&Self::key(namespace, name)).await? {
            Some(d) => decode(&d).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self, namespace: &str, component_name: &str) -> Result<Vec<RevisionSnapshot>, StoreError> {
        let docs = self.store.list(REVISION_API_VERSION, REVISION_KIND, namespace, &LabelSelector::of(LABEL_CONTROLLER_COMPONENT, component_name)).await?;
        let mut out = docs.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|s| s.revision);
        Ok(out)
    }

    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.store.delete(&Self::key(namespace, name)).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}
