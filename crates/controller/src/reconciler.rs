//! The reconcile state machine for one composition.
//!
//! A pass fetches the composition, handles deletion and the scope finalizer,
//! runs pre-hooks, renders, applies, collects garbage, derives status, runs
//! post-hooks and picks the next poll interval. Failures after the fetch are
//! recorded as a `Synced=False` condition and retried after the short wait;
//! post-hooks still run on those failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use keel_apply::{eligible, Applicator};
use keel_core::model::{reconcile_error, reconcile_success, Composition};
use keel_core::{DefinitionLookup, Document, ObjectKey, ObjectStore, RevisionStore, SCOPE_FINALIZER};
use keel_render::ComponentRenderer;
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::hooks::Hooks;
use crate::status::derive_workloads;

/// When to run the next pass; `None` waits for the next change notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self { Self { requeue_after: None } }
    pub fn after(d: Duration) -> Self { Self { requeue_after: Some(d) } }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    revisions: Arc<dyn RevisionStore>,
    definitions: Arc<dyn DefinitionLookup>,
    hooks: Hooks,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        revisions: Arc<dyn RevisionStore>,
        definitions: Arc<dyn DefinitionLookup>,
        hooks: Hooks,
        config: ControllerConfig,
    ) -> Self {
        Self { store, revisions, definitions, hooks, config }
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// One bounded pass. Errors are fatal to this pass only (the composition
    /// could not be read or its status could not be written).
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let t0 = Instant::now();
        counter!("keel_reconcile_total", 1u64);
        let res = match tokio::time::timeout(self.config.reconcile_timeout(), self.pass(key)).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!("reconcile of {} exceeded {}s", key, self.config.reconcile_timeout_secs)),
        };
        if res.is_err() { counter!("keel_reconcile_err_total", 1u64, "stage" => "pass"); }
        histogram!("keel_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn pass(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let t0 = Instant::now();
        let Some(doc) = self.store.get_opt(key).await.with_context(|| format!("reading composition {}", key))? else {
            debug!(composition = %key.name, namespace = %key.namespace, "composition gone");
            return Ok(ReconcileResult::done());
        };
        let mut comp: Composition = doc.decode().with_context(|| format!("decoding composition {}", key))?;
        let before = comp.status.clone();
        let applicator = Applicator::new(self.store.as_ref(), self.definitions.as_ref());

        if comp.is_deleting() {
            if !comp.has_finalizer(SCOPE_FINALIZER) { return Ok(ReconcileResult::done()); }
            if let Err(e) = applicator.unbind_all(comp.namespace(), &comp.status.workloads).await {
                return self.fail(&doc, &mut comp, "finalize", e).await;
            }
            comp.remove_finalizer(SCOPE_FINALIZER);
            self.persist_finalizers(&doc, &comp).await?;
            info!(composition = %comp.name(), namespace = %comp.namespace(), "finalized");
            return Ok(ReconcileResult::done());
        }

        if comp.uses_scopes() && !comp.has_finalizer(SCOPE_FINALIZER) {
            comp.add_finalizer(SCOPE_FINALIZER);
            self.persist_finalizers(&doc, &comp).await?;
            debug!(composition = %comp.name(), "registered scope finalizer");
            return Ok(ReconcileResult::after(Duration::ZERO));
        }

        let mut requeue: Option<Duration> = None;
        for (name, hook) in &self.hooks.pre {
            match hook.exec(&comp).await {
                Ok(d) => requeue = d.or(requeue),
                Err(e) => return self.fail(&doc, &mut comp, "pre-hook", e.context(format!("pre-hook {}", name))).await,
            }
        }

        let renderer = ComponentRenderer::new(self.store.as_ref(), self.revisions.as_ref(), self.definitions.as_ref());
        let outcome = match renderer.render(&comp).await {
            Ok(o) => o,
            Err(e) => return self.fail(&doc, &mut comp, "render", anyhow::Error::new(e).context("cannot render components")).await,
        };

        if let Err(e) = applicator.apply(&comp, &outcome.workloads).await {
            return self.fail(&doc, &mut comp, "apply", e.context("cannot apply components")).await;
        }

        for gone in eligible(comp.namespace(), &comp.status.workloads, &outcome.workloads) {
            match self.store.delete(&gone).await {
                Ok(()) => {
                    counter!("keel_gc_deleted_total", 1u64);
                    debug!(object = %gone, "garbage collected");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let err = anyhow::Error::new(e).context(format!("cannot delete {} {}", gone.kind, gone.name));
                    return self.fail(&doc, &mut comp, "gc", err).await;
                }
            }
        }

        let workloads = match derive_workloads(self.store.as_ref(), comp.name(), comp.namespace(), &outcome.workloads).await {
            Ok(w) => w,
            Err(e) => return self.fail(&doc, &mut comp, "status", e).await,
        };
        comp.status.workloads = workloads;
        comp.status.set_condition(reconcile_success());
        comp.status.dependency.unsatisfied = outcome.unsatisfied;
        gauge!("keel_dependency_unsatisfied", comp.status.dependency.unsatisfied.len() as f64);

        let (post_failed, post_requeue) = self.run_post_hooks(&mut comp).await;
        requeue = post_requeue.or(requeue);

        let next = if post_failed {
            self.config.short_wait()
        } else if let Some(d) = requeue {
            d
        } else if !comp.status.dependency.unsatisfied.is_empty() {
            self.config.depend_check_wait()
        } else {
            self.config.long_wait()
        };

        if comp.status != before {
            self.persist_status(&doc, &comp).await?;
        }
        info!(
            composition = %comp.name(),
            namespace = %comp.namespace(),
            workloads = comp.status.workloads.len(),
            unsatisfied = comp.status.dependency.unsatisfied.len(),
            requeue_s = next.as_secs(),
            took_ms = %t0.elapsed().as_millis(),
            "reconcile complete"
        );
        Ok(ReconcileResult::after(next))
    }

    async fn fail(&self, doc: &Document, comp: &mut Composition, stage: &'static str, err: anyhow::Error) -> Result<ReconcileResult> {
        warn!(composition = %comp.name(), namespace = %comp.namespace(), stage, error = %format!("{:#}", err), "reconcile failed");
        counter!("keel_reconcile_err_total", 1u64, "stage" => stage);
        comp.status.set_condition(reconcile_error(format!("{:#}", err)));
        // post-hooks run on every outcome; a failing one replaces the condition
        self.run_post_hooks(comp).await;
        self.persist_status(doc, comp).await?;
        Ok(ReconcileResult::after(self.config.short_wait()))
    }

    /// Run post-hooks in order. Returns whether any failed and the last requeue override.
    async fn run_post_hooks(&self, comp: &mut Composition) -> (bool, Option<Duration>) {
        let (mut failed, mut requeue) = (false, None);
        for (name, hook) in &self.hooks.post {
            match hook.exec(comp).await {
                Ok(d) => requeue = d.or(requeue),
                Err(e) => {
                    warn!(composition = %comp.name(), hook = %name, error = %e, "post-hook failed");
                    counter!("keel_reconcile_err_total", 1u64, "stage" => "post-hook");
                    comp.status.set_condition(reconcile_error(format!("post-hook {}: {:#}", name, e)));
                    failed = true;
                }
            }
        }
        (failed, requeue)
    }

    async fn persist_status(&self, doc: &Document, comp: &Composition) -> Result<()> {
        let mut d = doc.clone();
        d.set("status", serde_json::to_value(&comp.status)?)?;
        self.store.update_status(d).await.with_context(|| format!("updating status of composition {}", comp.name()))?;
        Ok(())
    }

    async fn persist_finalizers(&self, doc: &Document, comp: &Composition) -> Result<()> {
        let mut d = doc.clone();
        d.set("metadata.finalizers", json!(comp.metadata.finalizers.clone().unwrap_or_default()))?;
        self.store.update(d).await.with_context(|| format!("updating finalizers of composition {}", comp.name()))?;
        Ok(())
    }
}
