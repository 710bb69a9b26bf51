//! Keel revisions: immutable, numbered snapshots of a component's spec.

#![forbid(unsafe_code)]

pub mod manager;
pub mod naming;
pub mod store;

pub use manager::RevisionManager;
pub use naming::{construct_revision_name, extract_component_name};
pub use store::{StoreRevisionStore, REVISION_API_VERSION, REVISION_KIND};
