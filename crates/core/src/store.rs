//! Collaborator interfaces: the declarative object store, definition lookup and
//! revision snapshot storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::model::Component;
use crate::{Document, ObjectKey};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

/// Equality-based label selector (`k=v,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn of(key: &str, value: &str) -> Self {
        Self(BTreeMap::from([(key.to_string(), value.to_string())]))
    }

    pub fn and(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn to_query(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

/// Versioned, eventually-consistent declarative store.
///
/// Writes carrying a `metadata.resourceVersion` are optimistic: a stale version
/// fails with [`StoreError::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Document, StoreError>;

    /// List objects of a kind in `namespace` (all namespaces when empty).
    async fn list(&self, api_version: &str, kind: &str, namespace: &str, selector: &LabelSelector) -> Result<Vec<Document>, StoreError>;

    async fn create(&self, obj: Document) -> Result<Document, StoreError>;

    /// Replace spec/metadata; the status sub-resource is left untouched.
    async fn update(&self, obj: Document) -> Result<Document, StoreError>;

    /// Replace only the status sub-resource.
    async fn update_status(&self, obj: Document) -> Result<Document, StoreError>;

    /// JSON merge patch (RFC 7386).
    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<Document, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn get_opt(&self, key: &ObjectKey) -> Result<Option<Document>, StoreError> {
        match self.get(key).await {
            Ok(d) => Ok(Some(d)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitDefinition {
    pub name: String,
    #[serde(default)]
    pub revision_enabled: bool,
    #[serde(default)]
    pub applies_to_workloads: Vec<String>,
    #[serde(default)]
    pub workload_ref_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeDefinition {
    pub name: String,
    #[serde(default)]
    pub workload_refs_path: Option<String>,
}

/// Definition metadata keyed by the rendered object's kind. Unknown kinds
/// resolve to a default definition.
#[async_trait]
pub trait DefinitionLookup: Send + Sync {
    async fn trait_definition(&self, api_version: &str, kind: &str) -> Result<TraitDefinition, StoreError>;
    async fn scope_definition(&self, api_version: &str, kind: &str) -> Result<ScopeDefinition, StoreError>;
}

/// Immutable snapshot of a component at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSnapshot {
    pub name: String,
    pub namespace: String,
    pub component_name: String,
    pub revision: i64,
    pub component: Component,
}

#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Persist a new snapshot; returns its (name, number).
    async fn put(&self, snapshot: &RevisionSnapshot) -> Result<(String, i64), StoreError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<RevisionSnapshot>, StoreError>;
    /// Snapshots of one component, oldest first.
    async fn list(&self, namespace: &str, component_name: &str) -> Result<Vec<RevisionSnapshot>, StoreError>;
    /// Delete the oldest snapshots beyond `retain`; returns how many were removed.
    async fn prune(&self, namespace: &str, component_name: &str, retain: usize) -> Result<usize, StoreError> {
        let all = self.list(namespace, component_name).await?;
        let excess = all.len().saturating_sub(retain);
        for snap in all.iter().take(excess) { self.remove(namespace, &snap.name).await?; }
        Ok(excess)
    }
    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
