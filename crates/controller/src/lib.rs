//! Keel controller: the per-composition reconcile state machine, its hooks,
//! status derivation and a sequential work loop.

#![forbid(unsafe_code)]

pub mod config;
pub mod hooks;
pub mod reconciler;
pub mod runner;
pub mod status;

pub use config::ControllerConfig;
pub use hooks::{Hook, Hooks};
pub use reconciler::{ReconcileResult, Reconciler};
pub use runner::Runner;
pub use status::derive_workloads;
