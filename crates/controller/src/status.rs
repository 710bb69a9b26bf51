//! Derive `status.workloads` from a render pass.

use anyhow::{Context, Result};
use keel_core::model::{WorkloadScope, WorkloadStatus, WorkloadTrait};
use keel_core::{LabelSelector, ObjectStore, TypedReference, LABEL_APP_COMPONENT, LABEL_APP_NAME, LABEL_APP_REVISION};
use keel_render::RenderedWorkload;
use tracing::debug;

fn bare(r: TypedReference) -> TypedReference { TypedReference { uid: String::new(), ..r } }

/// One entry per rendered workload. Revision-aware workloads also report
/// other live instances of the same component still running under an older
/// revision, so a rollout across revisions stays visible.
pub async fn derive_workloads(store: &dyn ObjectStore, composition: &str, namespace: &str, rendered: &[RenderedWorkload]) -> Result<Vec<WorkloadStatus>> {
    let mut out = Vec::with_capacity(rendered.len());
    for w in rendered {
        let reference = bare(w.reference());
        out.push(WorkloadStatus {
            component_name: w.component_name.clone(),
            component_revision_name: w.revision_name.clone(),
            reference: reference.clone(),
            traits: w.traits.iter().map(|t| WorkloadTrait { reference: bare(t.object.typed_reference()) }).collect(),
            scopes: w.scopes.iter().map(|s| WorkloadScope { reference: s.reference.clone() }).collect(),
        });
        if !w.revision_enabled { continue; }

        let sel = LabelSelector::of(LABEL_APP_COMPONENT, &w.component_name).and(LABEL_APP_NAME, composition);
        let live = store
            .list(&reference.api_version, &reference.kind, namespace, &sel)
            .await
            .with_context(|| format!("listing {} instances of component {}", reference.kind, w.component_name))?;
        for other in live.iter().filter(|o| o.name() != reference.name) {
            let revision = other.labels().get(LABEL_APP_REVISION).cloned().unwrap_or_else(|| other.name().to_string());
            debug!(component = %w.component_name, instance = %other.name(), %revision, "older revision instance still live");
            out.push(WorkloadStatus {
                component_name: w.component_name.clone(),
                component_revision_name: revision,
                reference: bare(other.typed_reference()),
                ..Default::default()
            });
        }
    }
    Ok(out)
}
