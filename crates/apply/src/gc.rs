//! Garbage collection: previously applied objects that the latest render no longer declares.

use keel_core::model::WorkloadStatus;
use keel_core::ObjectKey;
use keel_render::RenderedWorkload;
use rustc_hash::FxHashSet;

/// Objects recorded in `previous` but absent from `rendered` (workloads and
/// traits). A workload named `<componentName>-...` is kept: it is an older
/// revision instance that must outlive the latest render.
pub fn eligible(namespace: &str, previous: &[WorkloadStatus], rendered: &[RenderedWorkload]) -> Vec<ObjectKey> {
    let mut applied: FxHashSet<(String, String, String)> = FxHashSet::default();
    for w in rendered {
        applied.insert(identity(w.object.api_version(), w.object.kind(), w.object.name()));
        for t in &w.traits {
            applied.insert(identity(t.object.api_version(), t.object.kind(), t.object.name()));
        }
    }

    let mut out = Vec::new();
    for ws in previous {
        let r = &ws.reference;
        let revision_instance = r.name.starts_with(&format!("{}-", ws.component_name));
        if !applied.contains(&identity(&r.api_version, &r.kind, &r.name)) && !revision_instance {
            out.push(r.key(namespace));
        }
        for t in &ws.traits {
            let r = &t.reference;
            if !applied.contains(&identity(&r.api_version, &r.kind, &r.name)) {
                out.push(r.key(namespace));
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

fn identity(api_version: &str, kind: &str, name: &str) -> (String, String, String) {
    (api_version.to_string(), kind.to_string(), name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::model::WorkloadTrait;
    use keel_core::{Document, TraitDefinition, TypedReference};
    use keel_render::RenderedTrait;
    use serde_json::json;

    fn tref(kind: &str, name: &str) -> TypedReference {
        TypedReference { api_version: "example.dev/v1".into(), kind: kind.into(), name: name.into(), uid: String::new() }
    }

    fn obj(kind: &str, name: &str) -> Document {
        Document::from_json(json!({"apiVersion": "example.dev/v1", "kind": kind, "metadata": {"name": name}})).unwrap()
    }

    fn rendered(component: &str, name: &str, traits: &[(&str, &str)]) -> RenderedWorkload {
        RenderedWorkload {
            component_name: component.into(),
            revision_name: String::new(),
            pinned: false,
            revision_enabled: false,
            object: obj("Deploy", name),
            traits: traits
                .iter()
                .map(|(k, n)| RenderedTrait { object: obj(k, n), definition: TraitDefinition::default(), has_dependency: false })
                .collect(),
            scopes: vec![],
            has_dependency: false,
        }
    }

    fn status(component: &str, name: &str, traits: &[(&str, &str)]) -> WorkloadStatus {
        WorkloadStatus {
            component_name: component.into(),
            reference: tref("Deploy", name),
            traits: traits.iter().map(|(k, n)| WorkloadTrait { reference: tref(k, n) }).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn removed_trait_is_eligible() {
        let prev = vec![status("c", "c", &[("Scaler", "t1"), ("Route", "t2")])];
        let now = vec![rendered("c", "c", &[("Scaler", "t1")])];
        assert_eq!(eligible("ns", &prev, &now), vec![ObjectKey::new("example.dev/v1", "Route", "ns", "t2")]);
    }

    #[test]
    fn removed_component_takes_workload_and_traits() {
        let prev = vec![status("a", "a", &[("Scaler", "a-s")]), status("b", "b", &[])];
        let now = vec![rendered("b", "b", &[])];
        let got = eligible("ns", &prev, &now);
        assert_eq!(got.len(), 2);
        assert!(got.contains(&ObjectKey::new("example.dev/v1", "Deploy", "ns", "a")));
        assert!(got.contains(&ObjectKey::new("example.dev/v1", "Scaler", "ns", "a-s")));
    }

    #[test]
    fn revision_instances_survive() {
        let prev = vec![status("web", "web-v1", &[("Canary", "web-canary")])];
        let now = vec![rendered("web", "web-v2", &[("Canary", "web-canary")])];
        assert!(eligible("ns", &prev, &now).is_empty());
        // same kind, different name outside the prefix is collected
        let prev = vec![status("web", "other", &[])];
        assert_eq!(eligible("ns", &prev, &now).len(), 1);
    }

    #[test]
    fn identity_includes_kind_and_api_version() {
        let prev = vec![status("c", "c", &[("Scaler", "same")])];
        let now = vec![rendered("c", "c", &[("Route", "same")])];
        assert_eq!(eligible("ns", &prev, &now), vec![ObjectKey::new("example.dev/v1", "Scaler", "ns", "same")]);
    }
}
