//! Component rendering: expand a composition into concrete workloads, traits
//! and scope references, wiring data-flow edges along the way.
//!
//! Rendering is all-or-nothing. Any error aborts the pass for the whole
//! composition so that nothing from a half-rendered spec reaches the store.

use std::time::Instant;

use keel_core::model::{Component, ComponentTrait, Composition, CompositionComponent, UnsatisfiedDependency};
use keel_core::{
    fnv1a64, DefinitionLookup, Document, ObjectKey, ObjectStore, RenderError, RevisionStore, ScopeDefinition, TraitDefinition,
    TypedReference, KIND_COMPONENT, LABEL_APP_COMPONENT, LABEL_APP_NAME, LABEL_APP_REVISION, LABEL_RESOURCE_TYPE, OAM_API_VERSION,
    RESOURCE_TYPE_TRAIT, RESOURCE_TYPE_WORKLOAD,
};
use metrics::histogram;
use tracing::{debug, info};

use crate::dependency::{DependencyEvaluator, DependencyGraph};
use crate::object::{render_object, render_trait};
use crate::params::resolve_parameters;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedTrait {
    pub object: Document,
    pub definition: TraitDefinition,
    /// An input of this trait is not ready; do not apply it this pass.
    pub has_dependency: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedScope {
    pub reference: TypedReference,
    pub definition: ScopeDefinition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedWorkload {
    pub component_name: String,
    pub revision_name: String,
    /// Bound to a pinned revision rather than the live component.
    pub pinned: bool,
    /// Some trait definition asks for one workload instance per revision.
    pub revision_enabled: bool,
    pub object: Document,
    pub traits: Vec<RenderedTrait>,
    pub scopes: Vec<RenderedScope>,
    pub has_dependency: bool,
}

impl RenderedWorkload {
    pub fn reference(&self) -> TypedReference { self.object.typed_reference() }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderOutcome {
    pub workloads: Vec<RenderedWorkload>,
    pub unsatisfied: Vec<UnsatisfiedDependency>,
}

pub struct ComponentRenderer<'a> {
    store: &'a dyn ObjectStore,
    revisions: &'a dyn RevisionStore,
    definitions: &'a dyn DefinitionLookup,
}

impl<'a> ComponentRenderer<'a> {
    pub fn new(store: &'a dyn ObjectStore, revisions: &'a dyn RevisionStore, definitions: &'a dyn DefinitionLookup) -> Self {
        Self { store, revisions, definitions }
    }

    pub async fn render(&self, comp: &Composition) -> Result<RenderOutcome, RenderError> {
        let t0 = Instant::now();
        let mut graph = DependencyGraph::default();
        let mut workloads = Vec::with_capacity(comp.spec.components.len());
        for entry in &comp.spec.components {
            workloads.push(self.render_component(comp, entry, &mut graph).await?);
        }

        // inputs resolve only after every output is registered
        let owner = comp.owner_reference();
        let eval = DependencyEvaluator::new(self.store, comp.namespace(), &owner);
        let mut unsatisfied = Vec::new();
        for (w, entry) in workloads.iter_mut().zip(&comp.spec.components) {
            if let Some(u) = eval.fill_inputs(&graph, &entry.data_inputs, &mut w.object).await? {
                w.has_dependency = true;
                unsatisfied.push(u);
            }
            for (t, ct) in w.traits.iter_mut().zip(&entry.traits) {
                if let Some(u) = eval.fill_inputs(&graph, &ct.data_inputs, &mut t.object).await? {
                    t.has_dependency = true;
                    unsatisfied.push(u);
                }
            }
        }

        let took = t0.elapsed();
        histogram!("keel_render_ms", took.as_secs_f64() * 1000.0);
        info!(
            composition = %comp.name(),
            namespace = %comp.namespace(),
            workloads = workloads.len(),
            outputs = graph.len(),
            unsatisfied = unsatisfied.len(),
            took_ms = %took.as_millis(),
            "render complete"
        );
        Ok(RenderOutcome { workloads, unsatisfied })
    }

    async fn render_component(&self, comp: &Composition, entry: &CompositionComponent, graph: &mut DependencyGraph) -> Result<RenderedWorkload, RenderError> {
        let ns = comp.namespace();
        let (component, component_name, revision_name, pinned) = self.resolve_component(ns, entry).await?;

        let rendered = resolve_parameters(&component.spec.parameters, &entry.parameter_values)
            .and_then(|params| render_object(&component.spec.workload, &params))
            .map_err(|e| RenderError::RenderWorkloadFailed { component: component_name.clone(), reason: e.to_string() })?;
        let mut object = rendered;
        self.stamp(comp, &mut object);
        object.set_label(LABEL_APP_COMPONENT, &component_name);
        object.set_label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_WORKLOAD);
        if !revision_name.is_empty() { object.set_label(LABEL_APP_REVISION, &revision_name); }

        let mut traits = Vec::with_capacity(entry.traits.len());
        for ct in &entry.traits {
            let t = self.render_one_trait(comp, &component_name, ct).await?;
            for out in &ct.data_outputs {
                graph.register(out, t.object.typed_reference())?;
            }
            traits.push(t);
        }

        let revision_enabled = traits.iter().any(|t| t.definition.revision_enabled);
        if object.name().is_empty() {
            let name = if pinned || (revision_enabled && !revision_name.is_empty()) { &revision_name } else { &component_name };
            object.set_name(name);
        }

        let mut scopes = Vec::with_capacity(entry.scopes.len());
        for cs in &entry.scopes {
            let r = &cs.scope_ref;
            let live = self.store.get(&r.key(ns)).await?;
            let definition = self.definitions.scope_definition(&r.api_version, &r.kind).await?;
            scopes.push(RenderedScope { reference: live.typed_reference(), definition });
        }

        for out in &entry.data_outputs {
            graph.register(out, object.typed_reference())?;
        }

        debug!(component = %component_name, revision = %revision_name, name = %object.name(), traits = traits.len(), "component rendered");
        Ok(RenderedWorkload { component_name, revision_name, pinned, revision_enabled, object, traits, scopes, has_dependency: false })
    }

    /// Returns (component, component name, revision name, pinned).
    async fn resolve_component(&self, ns: &str, entry: &CompositionComponent) -> Result<(Component, String, String, bool), RenderError> {
        let by_name = entry.component_name.as_deref().filter(|s| !s.is_empty());
        let by_rev = entry.revision_name.as_deref().filter(|s| !s.is_empty());
        match (by_name, by_rev) {
            (Some(c), Some(r)) => Err(RenderError::BothComponentAndRevision { component: c.into(), revision: r.into() }),
            (None, Some(r)) => {
                let snap = self.revisions.get(ns, r).await?.ok_or_else(|| RenderError::RevisionNotFound(r.into()))?;
                Ok((snap.component, snap.component_name, snap.name, true))
            }
            (Some(c), None) => {
                let key = ObjectKey::new(OAM_API_VERSION, KIND_COMPONENT, ns, c);
                let doc = match self.store.get(&key).await {
                    Ok(d) => d,
                    Err(e) if e.is_not_found() => return Err(RenderError::ComponentNotFound(c.into())),
                    Err(e) => return Err(e.into()),
                };
                let component: Component = doc
                    .decode()
                    .map_err(|e| RenderError::RenderWorkloadFailed { component: c.into(), reason: format!("malformed component: {}", e) })?;
                let rev = component.latest_revision_name().to_string();
                Ok((component, c.to_string(), rev, false))
            }
            (None, None) => Err(RenderError::NoComponentReference),
        }
    }

    async fn render_one_trait(&self, comp: &Composition, component_name: &str, ct: &ComponentTrait) -> Result<RenderedTrait, RenderError> {
        let mut object = render_trait(&ct.trait_)
            .map_err(|e| RenderError::RenderTraitFailed { component: component_name.into(), reason: e.to_string() })?;
        self.stamp(comp, &mut object);
        if object.name().is_empty() {
            let name = trait_name(comp, component_name, ct, object.kind());
            object.set_name(&name);
        }
        object.set_label(LABEL_APP_COMPONENT, component_name);
        object.set_label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_TRAIT);
        let definition = self.definitions.trait_definition(object.api_version(), object.kind()).await?;
        Ok(RenderedTrait { object, definition, has_dependency: false })
    }

    fn stamp(&self, comp: &Composition, object: &mut Document) {
        let labels = comp.metadata.labels.clone().unwrap_or_default();
        let annotations = comp.metadata.annotations.clone().unwrap_or_default();
        object.pass_through(&labels, &annotations);
        object.set_controller(&comp.owner_reference());
        object.set_namespace(comp.namespace());
        object.set_label(LABEL_APP_NAME, comp.name());
    }
}

/// Name for a trait without an explicit one: the name recorded for the same
/// component and kind on a previous pass, else `<component>-<kind>-<hash>`.
pub fn trait_name(comp: &Composition, component_name: &str, ct: &ComponentTrait, kind: &str) -> String {
    let prior = comp
        .status
        .workloads
        .iter()
        .filter(|w| w.component_name == component_name)
        .flat_map(|w| w.traits.iter())
        .find(|t| t.reference.kind == kind && !t.reference.name.is_empty());
    if let Some(t) = prior {
        return t.reference.name.clone();
    }
    let bytes = serde_json::to_vec(ct).unwrap_or_default();
    format!("{}-{}-{:x}", component_name, kind.to_lowercase(), fnv1a64(&bytes) as u32)
}
