//! Multi-document YAML manifests for offline rendering.

use anyhow::{Context, Result};
use keel_core::{Document, KIND_SCOPE_DEFINITION, KIND_TRAIT_DEFINITION};
use serde::Deserialize;
use serde_json::Value as Json;

fn cluster_scoped(kind: &str) -> bool { kind == KIND_TRAIT_DEFINITION || kind == KIND_SCOPE_DEFINITION }

/// Parse every non-empty document; namespaced objects without a namespace get `default_ns`.
pub fn parse(text: &str, default_ns: &str) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let v = Json::deserialize(de).with_context(|| format!("parsing manifest document {}", i + 1))?;
        if v.is_null() { continue; }
        let mut doc = Document::from_json(v).with_context(|| format!("manifest document {} is not an object", i + 1))?;
        if doc.name().is_empty() || doc.kind().is_empty() {
            anyhow::bail!("manifest document {} needs kind and metadata.name", i + 1);
        }
        if doc.namespace().is_empty() && !cluster_scoped(doc.kind()) {
            doc.set_namespace(default_ns);
        }
        out.push(doc);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_namespace_except_for_definitions() {
        let text = r#"
apiVersion: core.oam.dev/v1alpha2
kind: Component
metadata:
  name: web
spec:
  workload: {apiVersion: v1, kind: ConfigMap}
---
---
apiVersion: core.oam.dev/v1alpha2
kind: TraitDefinition
metadata:
  name: scalers.example.dev
spec:
  revisionEnabled: true
---
apiVersion: core.oam.dev/v1alpha2
kind: ApplicationConfiguration
metadata:
  name: app
  namespace: prod
"#;
        let docs = parse(text, "default").unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].namespace(), "default");
        assert_eq!(docs[1].namespace(), "");
        assert_eq!(docs[2].namespace(), "prod");
    }

    #[test]
    fn rejects_nameless_documents() {
        let err = parse("apiVersion: v1\nkind: ConfigMap\n", "default").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }
}
