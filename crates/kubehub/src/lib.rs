//! Keel kubehub: the declarative store backed by a Kubernetes API server,
//! plus discovery and watcher wiring for the controller loop.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use keel_core::{split_api_version, Document, LabelSelector, ObjectKey, ObjectStore, StoreError};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `ObjectStore` over `Api<DynamicObject>`. Resource metadata is resolved once
/// per (apiVersion, kind) and cached.
pub struct KubeStore {
    client: Client,
    field_manager: String,
    resources: Mutex<FxHashMap<(String, String), (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self { client, field_manager: field_manager.to_string(), resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default(field_manager: &str) -> Result<Self> { Ok(Self::new(Client::try_default().await?, field_manager)) }

    fn post_params(&self) -> PostParams { PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() } }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), StoreError> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(hit) = self.cache().get(&cache_key) {
            return Ok(hit.clone());
        }
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(format!("kind {} {} is not served", api_version, kind)),
            other => StoreError::Backend(other.to_string()),
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(%api_version, %kind, namespaced, "discovered resource");
        self.cache().insert(cache_key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, FxHashMap<(String, String), (ApiResource, bool)>> {
        self.resources.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resource(api_version, kind).await?;
        Ok(if namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }

    async fn api_for(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, StoreError> {
        self.api(&key.api_version, &key.kind, &key.namespace).await
    }
}

fn map_err(e: kube::Error, what: &ObjectKey) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => StoreError::Invalid(format!("{}: {}", what, ae.message)),
        other => StoreError::Backend(format!("{}: {}", what, other)),
    }
}

fn to_document(obj: &DynamicObject) -> Result<Document, StoreError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Document::from_json(raw).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn to_dynamic(doc: Document) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(doc.into_json()).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Document, StoreError> {
        let api = self.api_for(key).await?;
        let obj = api.get(&key.name).await.map_err(|e| map_err(e, key))?;
        to_document(&obj)
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: &str, selector: &LabelSelector) -> Result<Vec<Document>, StoreError> {
        let api = self.api(api_version, kind, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() { lp = lp.labels(&selector.to_query()); }
        let what = ObjectKey::new(api_version, kind, namespace, "");
        let list = api.list(&lp).await.map_err(|e| map_err(e, &what))?;
        list.items.iter().map(to_document).collect()
    }

    async fn create(&self, obj: Document) -> Result<Document, StoreError> {
        let key = obj.key();
        let api = self.api_for(&key).await?;
        let created = api.create(&self.post_params(), &to_dynamic(obj)?).await.map_err(|e| map_err(e, &key))?;
        counter!("kube_writes_total", 1u64, "verb" => "create");
        to_document(&created)
    }

    async fn update(&self, obj: Document) -> Result<Document, StoreError> {
        let key = obj.key();
        let api = self.api_for(&key).await?;
        let updated = api.replace(&key.name, &self.post_params(), &to_dynamic(obj)?).await.map_err(|e| map_err(e, &key))?;
        counter!("kube_writes_total", 1u64, "verb" => "update");
        to_document(&updated)
    }

    async fn update_status(&self, obj: Document) -> Result<Document, StoreError> {
        let key = obj.key();
        let api = self.api_for(&key).await?;
        let body = serde_json::to_vec(obj.as_json()).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let updated = api.replace_status(&key.name, &self.post_params(), body).await.map_err(|e| map_err(e, &key))?;
        counter!("kube_writes_total", 1u64, "verb" => "update_status");
        to_document(&updated)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<Document, StoreError> {
        let api = self.api_for(key).await?;
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let patched = api.patch(&key.name, &pp, &Patch::Merge(patch)).await.map_err(|e| map_err(e, key))?;
        counter!("kube_writes_total", 1u64, "verb" => "patch");
        to_document(&patched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let api = self.api_for(key).await?;
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_err(e, key))?;
        counter!("kube_writes_total", 1u64, "verb" => "delete");
        Ok(())
    }
}

/// List+watch one kind and forward the key of every touched object.
/// Returns when the receiver is dropped or the stream ends.
pub async fn watch_keys(store: &KubeStore, api_version: &str, kind: &str, namespace: Option<&str>, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let api = store.api(api_version, kind, namespace.unwrap_or("")).await.map_err(|e| anyhow!("resolving {} {}: {}", api_version, kind, e))?;
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(%api_version, %kind, ns = ?namespace, "watcher started");
    let key_of = |o: &DynamicObject| {
        ObjectKey::new(api_version, kind, o.metadata.namespace.as_deref().unwrap_or(""), o.metadata.name.as_deref().unwrap_or(""))
    };
    while let Some(ev) = stream.try_next().await? {
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(o) | Event::Deleted(o) => vec![key_of(&o)],
            Event::Restarted(list) => {
                debug!(%kind, count = list.len(), "watch restart");
                list.iter().map(key_of).collect()
            }
        };
        for k in keys {
            if tx.send(k).await.is_err() {
                return Ok(());
            }
        }
    }
    warn!(%kind, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_store_errors() {
        let key = ObjectKey::new("v1", "ConfigMap", "ns", "x");
        let api = |code: u16, reason: &str| {
            kube::Error::Api(kube::core::ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code })
        };
        assert!(map_err(api(404, "NotFound"), &key).is_not_found());
        assert!(matches!(map_err(api(409, "AlreadyExists"), &key), StoreError::AlreadyExists(_)));
        assert!(matches!(map_err(api(409, "Conflict"), &key), StoreError::Conflict(_)));
        assert!(matches!(map_err(api(422, "Invalid"), &key), StoreError::Invalid(_)));
        assert!(matches!(map_err(api(500, "InternalError"), &key), StoreError::Backend(_)));
    }

    #[test]
    fn documents_drop_managed_fields() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x", "namespace": "ns", "managedFields": [{"manager": "m"}]},
            "data": {"k": "v"}
        }))
        .unwrap();
        let d = to_document(&obj).unwrap();
        assert!(d.get("metadata.managedFields").is_err());
        assert_eq!(d.get_string("data.k").unwrap(), "v");
    }
}
