//! Definition lookup backed by `TraitDefinition` / `ScopeDefinition` objects.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{
    split_api_version, DefinitionLookup, Document, LabelSelector, ObjectStore, ScopeDefinition, StoreError, TraitDefinition,
    KIND_SCOPE_DEFINITION, KIND_TRAIT_DEFINITION, OAM_API_VERSION,
};
use serde_json::Value as Json;
use tracing::trace;

/// Matches definitions by `spec.definitionRef.name == <plural>.<group>`.
/// Kinds without a definition get a default one (no revisions, default ref paths).
pub struct StoreDefinitionLookup {
    store: Arc<dyn ObjectStore>,
}

impl StoreDefinitionLookup {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }

    async fn find(&self, def_kind: &str, api_version: &str, kind: &str) -> Result<(String, Option<Document>), StoreError> {
        let want = definition_ref_name(api_version, kind);
        let defs = self.store.list(OAM_API_VERSION, def_kind, "", &LabelSelector::everything()).await?;
        let hit = defs.into_iter().find(|d| d.get_string("spec.definitionRef.name").map(|n| n == want).unwrap_or(false) || d.name() == want);
        trace!(def_kind, %want, found = hit.is_some(), "definition lookup");
        Ok((want, hit))
    }
}

#[async_trait]
impl DefinitionLookup for StoreDefinitionLookup {
    async fn trait_definition(&self, api_version: &str, kind: &str) -> Result<TraitDefinition, StoreError> {
        let (want, hit) = self.find(KIND_TRAIT_DEFINITION, api_version, kind).await?;
        let Some(d) = hit else { return Ok(TraitDefinition { name: want, ..Default::default() }) };
        Ok(TraitDefinition {
            name: d.name().to_string(),
            revision_enabled: d.get("spec.revisionEnabled").ok().and_then(Json::as_bool).unwrap_or(false),
            applies_to_workloads: d
                .get("spec.appliesToWorkloads")
                .ok()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            workload_ref_path: non_empty(&d, "spec.workloadRefPath"),
        })
    }

    async fn scope_definition(&self, api_version: &str, kind: &str) -> Result<ScopeDefinition, StoreError> {
        let (want, hit) = self.find(KIND_SCOPE_DEFINITION, api_version, kind).await?;
        let Some(d) = hit else { return Ok(ScopeDefinition { name: want, ..Default::default() }) };
        Ok(ScopeDefinition { name: d.name().to_string(), workload_refs_path: non_empty(&d, "spec.workloadRefsPath") })
    }
}

fn non_empty(d: &Document, path: &str) -> Option<String> {
    d.get_string(path).ok().filter(|s| !s.is_empty()).map(str::to_string)
}

/// `<plural>.<group>`, or just the plural for core kinds.
pub fn definition_ref_name(api_version: &str, kind: &str) -> String {
    let (group, _) = split_api_version(api_version);
    let plural = pluralize(&kind.to_lowercase());
    if group.is_empty() { plural } else { format!("{}.{}", plural, group) }
}

// English plural rules as applied to resource kinds.
fn pluralize(k: &str) -> String {
    if k.ends_with('s') || k.ends_with('x') || k.ends_with("ch") || k.ends_with("sh") {
        return format!("{}es", k);
    }
    if let Some(stem) = k.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{}ies", stem);
        }
    }
    format!("{}s", k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_names() {
        assert_eq!(definition_ref_name("core.oam.dev/v1alpha2", "ManualScalerTrait"), "manualscalertraits.core.oam.dev");
        assert_eq!(definition_ref_name("networking.k8s.io/v1", "Ingress"), "ingresses.networking.k8s.io");
        assert_eq!(definition_ref_name("example.dev/v1", "Policy"), "policies.example.dev");
        assert_eq!(definition_ref_name("example.dev/v1", "Gateway"), "gateways.example.dev");
        assert_eq!(definition_ref_name("v1", "Service"), "services");
    }
}
