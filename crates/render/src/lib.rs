//! Keel render: expand a composition into concrete objects.
//!
//! Leaf-first: parameters are resolved against a component's declarations,
//! substituted into the raw payload, and the per-pass dependency graph decides
//! which rendered objects may be applied now.

#![forbid(unsafe_code)]

pub mod component;
pub mod definition;
pub mod dependency;
pub mod object;
pub mod params;

pub use component::{ComponentRenderer, RenderOutcome, RenderedScope, RenderedTrait, RenderedWorkload};
pub use definition::StoreDefinitionLookup;
pub use dependency::{check_readiness, DependencyEvaluator, DependencyGraph, Readiness, SourceInfo};
pub use object::{render_object, render_trait};
pub use params::{resolve_parameters, ResolvedParameter};
