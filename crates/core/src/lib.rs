//! Keel core types: path-addressable documents, the composition model and the
//! collaborator traits (object store, definitions, revisions) the engine runs on.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod document;
pub mod error;
pub mod model;
pub mod path;
pub mod store;

pub use document::{merge_json, Document};
pub use error::RenderError;
pub use path::PathError;
pub use store::{DefinitionLookup, LabelSelector, ObjectStore, RevisionSnapshot, RevisionStore, ScopeDefinition, StoreError, TraitDefinition};

pub const OAM_API_VERSION: &str = "core.oam.dev/v1alpha2";
pub const KIND_COMPOSITION: &str = "ApplicationConfiguration";
pub const KIND_COMPONENT: &str = "Component";
pub const KIND_TRAIT_DEFINITION: &str = "TraitDefinition";
pub const KIND_SCOPE_DEFINITION: &str = "ScopeDefinition";

pub const LABEL_APP_NAME: &str = "app.oam.dev/name";
pub const LABEL_APP_COMPONENT: &str = "app.oam.dev/component";
pub const LABEL_APP_REVISION: &str = "app.oam.dev/revision";
pub const LABEL_RESOURCE_TYPE: &str = "app.oam.dev/resourceType";
/// Label stamped on revision snapshots to find them by owning component.
pub const LABEL_CONTROLLER_COMPONENT: &str = "controller.oam.dev/component";

pub const RESOURCE_TYPE_WORKLOAD: &str = "WORKLOAD";
pub const RESOURCE_TYPE_TRAIT: &str = "TRAIT";

/// Finalizer guarding scope membership cleanup of a composition.
pub const SCOPE_FINALIZER: &str = "scope.finalizer.core.oam.dev";

/// Store address of an object. Empty namespace means cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() { write!(f, "{} {}", self.kind, self.name) } else { write!(f, "{} {}/{}", self.kind, self.namespace, self.name) }
    }
}

/// Namespace-relative reference to an object of a given kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl TypedReference {
    /// (apiVersion, kind, name); uid is ignored when comparing identities.
    pub fn identity(&self) -> (&str, &str, &str) { (&self.api_version, &self.kind, &self.name) }

    pub fn same_object(&self, other: &TypedReference) -> bool { self.identity() == other.identity() }

    pub fn key(&self, namespace: &str) -> ObjectKey { ObjectKey::new(&self.api_version, &self.kind, namespace, &self.name) }
}

/// Split `group/version` into its parts; core kinds have an empty group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// 64-bit FNV-1a, stable across processes for name derivation.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
    h
}
