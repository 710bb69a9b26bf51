//! Sequential work loop: one in-flight reconcile at a time, keys deduplicated
//! while they wait, each key requeued after the interval its pass chose.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_core::model::Composition;
use keel_core::{LabelSelector, ObjectKey, ObjectStore, KIND_COMPOSITION, OAM_API_VERSION};
use keel_revision::RevisionManager;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::reconciler::Reconciler;

pub struct Runner {
    store: Arc<dyn ObjectStore>,
    reconciler: Reconciler,
    revisions: RevisionManager,
    due: FxHashMap<ObjectKey, Instant>,
}

impl Runner {
    pub fn new(store: Arc<dyn ObjectStore>, reconciler: Reconciler, revisions: RevisionManager) -> Self {
        Self { store, reconciler, revisions, due: FxHashMap::default() }
    }

    /// Schedule `key` no later than `after` from now. An earlier pending
    /// deadline wins.
    pub fn enqueue(&mut self, key: ObjectKey, after: Duration) {
        let at = Instant::now() + after;
        self.due.entry(key).and_modify(|t| if at < *t { *t = at }).or_insert(at);
    }

    pub fn pending(&self) -> usize { self.due.len() }

    fn next_due(&self) -> Option<(ObjectKey, Instant)> {
        self.due.iter().min_by_key(|(_, t)| **t).map(|(k, t)| (k.clone(), *t))
    }

    /// Reconcile the earliest key if it is due. Returns false when nothing was due.
    pub async fn step(&mut self) -> bool {
        let Some((key, at)) = self.next_due() else { return false };
        if at > Instant::now() { return false; }
        self.due.remove(&key);
        match self.reconciler.reconcile(&key).await {
            Ok(res) => {
                if let Some(d) = res.requeue_after { self.enqueue(key, d); }
            }
            Err(e) => {
                warn!(composition = %key.name, namespace = %key.namespace, error = %format!("{:#}", e), "reconcile pass aborted");
                let d = self.reconciler.config().short_wait();
                self.enqueue(key, d);
            }
        }
        true
    }

    /// Mint a revision if needed, then wake every composition that tracks the component.
    pub async fn component_changed(&mut self, key: &ObjectKey) -> Result<()> {
        if let Some(rev) = self.revisions.on_component_changed(key).await? {
            debug!(component = %key.name, revision = %rev.name, "component revised");
        }
        let comps = self.store.list(OAM_API_VERSION, KIND_COMPOSITION, &key.namespace, &LabelSelector::everything()).await?;
        for doc in comps {
            let comp: Composition = match doc.decode() {
                Ok(c) => c,
                Err(e) => {
                    warn!(composition = %doc.name(), error = %e, "skipping undecodable composition");
                    continue;
                }
            };
            if comp.spec.components.iter().any(|c| c.component_name.as_deref() == Some(key.name.as_str())) {
                self.enqueue(ObjectKey::new(OAM_API_VERSION, KIND_COMPOSITION, comp.namespace(), comp.name()), Duration::ZERO);
            }
        }
        Ok(())
    }

    /// Drive the loop until `shutdown` resolves or both event channels close.
    pub async fn run(
        mut self,
        mut compositions: mpsc::Receiver<ObjectKey>,
        mut components: mpsc::Receiver<ObjectKey>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);
        let (mut comps_open, mut components_open) = (true, true);
        info!("controller loop started");
        loop {
            if !comps_open && !components_open && self.due.is_empty() { break; }
            let wake = self.next_due().map(|(_, t)| t).unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = &mut shutdown => {
                    info!(pending = self.due.len(), "controller loop stopping");
                    break;
                }
                k = compositions.recv(), if comps_open => match k {
                    Some(k) => self.enqueue(k, Duration::ZERO),
                    None => comps_open = false,
                },
                k = components.recv(), if components_open => match k {
                    Some(k) => {
                        if let Err(e) = self.component_changed(&k).await {
                            warn!(component = %k.name, error = %format!("{:#}", e), "component event failed");
                        }
                    }
                    None => components_open = false,
                },
                _ = tokio::time::sleep_until(wake) => {
                    self.step().await;
                }
            }
        }
        Ok(())
    }
}
