#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_controller::{ControllerConfig, Hook, Hooks, Reconciler};
use keel_core::model::Composition;
use keel_core::{Document, ObjectKey, ObjectStore, StoreError, KIND_COMPOSITION, OAM_API_VERSION};
use keel_render::StoreDefinitionLookup;
use keel_revision::{RevisionManager, StoreRevisionStore};
use keel_store::{MemStore, Verb};
use serde_json::{json, Value};

struct Env {
    store: Arc<MemStore>,
    revisions: Arc<StoreRevisionStore>,
}

impl Env {
    fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let revisions = Arc::new(StoreRevisionStore::new(store.clone()));
        Self { store, revisions }
    }

    fn reconciler(&self, hooks: Hooks) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.revisions.clone(),
            Arc::new(StoreDefinitionLookup::new(self.store.clone())),
            hooks,
            ControllerConfig::default(),
        )
    }

    fn revision_manager(&self) -> RevisionManager { RevisionManager::new(self.store.clone(), self.revisions.clone(), 10) }

    async fn component(&self, name: &str, workload: Value) {
        let d = Document::from_json(json!({
            "apiVersion": "core.oam.dev/v1alpha2", "kind": "Component",
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"workload": workload}
        }))
        .unwrap();
        self.store.create(d).await.unwrap();
    }

    async fn composition(&self, name: &str, components: Value) -> ObjectKey {
        let d = Document::from_json(json!({
            "apiVersion": OAM_API_VERSION, "kind": KIND_COMPOSITION,
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"components": components}
        }))
        .unwrap();
        self.store.create(d).await.unwrap().key()
    }

    async fn status_of(&self, key: &ObjectKey) -> Composition { self.store.get(key).await.unwrap().decode().unwrap() }

    async fn object(&self, api_version: &str, kind: &str, name: &str) -> Option<Document> {
        self.store.get_opt(&ObjectKey::new(api_version, kind, "ns", name)).await.unwrap()
    }
}

fn widget(kind: &str) -> Value { json!({"apiVersion": "example.dev/v1", "kind": kind, "spec": {}}) }

#[tokio::test]
async fn data_dependency_waits_then_fills() {
    let env = Env::new();
    env.component("producer", widget("Widget")).await;
    env.component("consumer", widget("Gadget")).await;
    let key = env
        .composition(
            "app",
            json!([
                {"componentName": "producer", "dataOutputs": [{"name": "o", "fieldPath": "status.key"}]},
                {"componentName": "consumer", "dataInputs": [{"valueFrom": {"dataOutputName": "o"}, "toFieldPaths": ["spec.key"]}]}
            ]),
        )
        .await;
    let r = env.reconciler(Hooks::default());

    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(10)));
    assert!(env.object("example.dev/v1", "Widget", "producer").await.is_some());
    assert!(env.object("example.dev/v1", "Gadget", "consumer").await.is_none());
    let st = env.status_of(&key).await.status;
    assert_eq!(st.dependency.unsatisfied.len(), 1);
    let u = &st.dependency.unsatisfied[0];
    assert_eq!(u.from.reference.name, "producer");
    assert_eq!(u.from.field_path, "status.key");
    assert_eq!(u.to.reference.name, "consumer");
    assert_eq!(u.to.field_paths, vec!["spec.key".to_string()]);
    assert_eq!(st.condition("Synced").unwrap().status, "True");

    let mut producer = env.object("example.dev/v1", "Widget", "producer").await.unwrap();
    producer.set_string("status.key", "v1").unwrap();
    env.store.update_status(producer).await.unwrap();

    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(60)));
    let consumer = env.object("example.dev/v1", "Gadget", "consumer").await.unwrap();
    assert_eq!(consumer.get_string("spec.key").unwrap(), "v1");
    assert!(env.status_of(&key).await.status.dependency.unsatisfied.is_empty());
}

#[tokio::test]
async fn removed_trait_is_collected_and_the_rest_untouched() {
    let env = Env::new();
    env.component("c", json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"k": "v"}})).await;
    let scaler = json!({"trait": {"apiVersion": "example.dev/v1", "kind": "Scaler", "spec": {"replicas": 2}}});
    let route = json!({"trait": {"apiVersion": "example.dev/v1", "kind": "Route", "spec": {"host": "a.example"}}});
    let key = env.composition("app", json!([{"componentName": "c", "traits": [scaler.clone(), route]}])).await;
    let r = env.reconciler(Hooks::default());
    r.reconcile(&key).await.unwrap();

    let workload = env.object("v1", "ConfigMap", "c").await.unwrap();
    let scalers = env.store.objects_of("Scaler");
    assert_eq!(scalers.len(), 1);
    assert_eq!(env.store.objects_of("Route").len(), 1);
    assert_eq!(scalers[0].get("spec.workloadRef.name").unwrap(), &json!("c"));

    let mut doc = env.store.get(&key).await.unwrap();
    doc.set("spec.components[0].traits", json!([scaler])).unwrap();
    env.store.update(doc).await.unwrap();
    r.reconcile(&key).await.unwrap();

    assert!(env.store.objects_of("Route").is_empty());
    let after = env.store.objects_of("Scaler");
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].uid(), scalers[0].uid());
    assert_eq!(after[0].generation(), scalers[0].generation());
    let workload_after = env.object("v1", "ConfigMap", "c").await.unwrap();
    assert_eq!(workload_after.uid(), workload.uid());
    assert_eq!(workload_after.generation(), workload.generation());
    let st = env.status_of(&key).await.status;
    assert_eq!(st.workloads[0].traits.len(), 1);
    assert_eq!(st.workloads[0].traits[0].reference.kind, "Scaler");
}

#[tokio::test]
async fn tracking_updates_in_place_while_pinned_revisions_stay_put() {
    let env = Env::new();
    let mgr = env.revision_manager();
    let component_key = ObjectKey::new(OAM_API_VERSION, "Component", "ns", "web");
    env.component("web", json!({"apiVersion": "apps/v1", "kind": "Deployment", "spec": {"image": "nginx:1"}})).await;
    let r1 = mgr.on_component_changed(&component_key).await.unwrap().unwrap();

    let track = env.composition("track", json!([{"componentName": "web"}])).await;
    let pin1 = env.composition("pin1", json!([{"revisionName": r1.name.clone()}])).await;
    let r = env.reconciler(Hooks::default());
    r.reconcile(&track).await.unwrap();
    r.reconcile(&pin1).await.unwrap();
    let tracked = env.object("apps/v1", "Deployment", "web").await.unwrap();
    let pinned = env.object("apps/v1", "Deployment", &r1.name).await.unwrap();
    assert_eq!(pinned.get_string("spec.image").unwrap(), "nginx:1");

    let mut c = env.store.get(&component_key).await.unwrap();
    c.set_string("spec.workload.spec.image", "nginx:2").unwrap();
    env.store.update(c).await.unwrap();
    let r2 = mgr.on_component_changed(&component_key).await.unwrap().unwrap();
    r.reconcile(&track).await.unwrap();
    r.reconcile(&pin1).await.unwrap();

    assert_eq!(env.store.objects_of("Deployment").len(), 2);
    let tracked_after = env.object("apps/v1", "Deployment", "web").await.unwrap();
    assert_eq!(tracked_after.uid(), tracked.uid());
    assert_eq!(tracked_after.get_string("spec.image").unwrap(), "nginx:2");
    let pinned_after = env.object("apps/v1", "Deployment", &r1.name).await.unwrap();
    assert_eq!(pinned_after.get_string("spec.image").unwrap(), "nginx:1");
    assert_eq!(pinned_after.generation(), pinned.generation());

    let pin2 = env.composition("pin2", json!([{"revisionName": r2.name.clone()}])).await;
    r.reconcile(&pin2).await.unwrap();
    assert_eq!(env.store.objects_of("Deployment").len(), 3);
    let second = env.object("apps/v1", "Deployment", &r2.name).await.unwrap();
    assert_eq!(second.get_string("spec.image").unwrap(), "nginx:2");
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let env = Env::new();
    env.component("web", widget("Widget")).await;
    let key = env
        .composition("app", json!([{"componentName": "web", "traits": [{"trait": {"apiVersion": "example.dev/v1", "kind": "Scaler", "spec": {}}}]}]))
        .await;
    let r = env.reconciler(Hooks::default());
    r.reconcile(&key).await.unwrap();
    let comp_rv = env.store.get(&key).await.unwrap().resource_version().to_string();
    let before: Vec<(String, String)> = env.store.snapshot().values().map(|d| (d.name().to_string(), d.resource_version().to_string())).collect();

    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(60)));
    assert_eq!(env.store.get(&key).await.unwrap().resource_version(), comp_rv);
    let mut after: Vec<(String, String)> = env.store.snapshot().values().map(|d| (d.name().to_string(), d.resource_version().to_string())).collect();
    let mut before = before;
    before.sort();
    after.sort();
    assert_eq!(before, after);
}

#[tokio::test]
async fn render_failure_is_recorded_and_retried_soon() {
    let env = Env::new();
    let key = env.composition("app", json!([{"componentName": "ghost"}])).await;
    let res = env.reconciler(Hooks::default()).reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    let st = env.status_of(&key).await.status;
    let cond = st.condition("Synced").unwrap();
    assert_eq!(cond.status, "False");
    assert_eq!(cond.reason, "ReconcileError");
    assert!(cond.message.contains("ghost"), "{}", cond.message);
}

#[tokio::test]
async fn post_hooks_run_after_a_failed_render() {
    let env = Env::new();
    let key = env.composition("app", json!([{"componentName": "ghost"}])).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Hooks::default().with_post("notify", recorder("notify", &log, false, Some(Duration::from_secs(5))));

    let res = env.reconciler(hooks).reconcile(&key).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["notify"]);
    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    let cond = env.status_of(&key).await.status.condition("Synced").cloned().unwrap();
    assert_eq!(cond.status, "False");
    assert!(cond.message.contains("ghost"), "{}", cond.message);
}

#[tokio::test]
async fn failing_post_hook_replaces_the_render_error() {
    let env = Env::new();
    let key = env.composition("app", json!([{"componentName": "ghost"}])).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Hooks::default().with_post("verify", recorder("verify", &log, true, None));

    let res = env.reconciler(hooks).reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    let cond = env.status_of(&key).await.status.condition("Synced").cloned().unwrap();
    assert_eq!(cond.status, "False");
    assert!(cond.message.contains("post-hook verify"), "{}", cond.message);
}

#[tokio::test]
async fn failed_garbage_delete_is_retried_soon() {
    let env = Env::new();
    env.component("c", json!({"apiVersion": "v1", "kind": "ConfigMap"})).await;
    let scaler = json!({"trait": {"apiVersion": "example.dev/v1", "kind": "Scaler", "spec": {}}});
    let route = json!({"trait": {"apiVersion": "example.dev/v1", "kind": "Route", "spec": {}}});
    let key = env.composition("app", json!([{"componentName": "c", "traits": [scaler.clone(), route]}])).await;
    let r = env.reconciler(Hooks::default());
    r.reconcile(&key).await.unwrap();
    let route_key = env.store.objects_of("Route")[0].key();

    let mut doc = env.store.get(&key).await.unwrap();
    doc.set("spec.components[0].traits", json!([scaler])).unwrap();
    env.store.update(doc).await.unwrap();
    env.store.fail_next(Verb::Delete, route_key.clone(), StoreError::Backend("etcd unavailable".into()));
    let res = r.reconcile(&key).await.unwrap();

    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    assert_eq!(env.store.objects_of("Route").len(), 1);
    let cond = env.status_of(&key).await.status.condition("Synced").cloned().unwrap();
    assert_eq!(cond.status, "False");
    assert!(cond.message.contains("cannot delete Route"), "{}", cond.message);

    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(60)));
    assert!(env.store.objects_of("Route").is_empty());
}

#[tokio::test]
async fn source_read_failure_fails_the_pass_instead_of_waiting() {
    let env = Env::new();
    env.component("producer", widget("Widget")).await;
    env.component("consumer", widget("Gadget")).await;
    let key = env
        .composition(
            "app",
            json!([
                {"componentName": "producer", "dataOutputs": [{"name": "o", "fieldPath": "status.key"}]},
                {"componentName": "consumer", "dataInputs": [{"valueFrom": {"dataOutputName": "o"}, "toFieldPaths": ["spec.key"]}]}
            ]),
        )
        .await;
    let r = env.reconciler(Hooks::default());
    r.reconcile(&key).await.unwrap();

    let producer = ObjectKey::new("example.dev/v1", "Widget", "ns", "producer");
    env.store.fail_next(Verb::Get, producer, StoreError::Backend("connection reset".into()));
    let res = r.reconcile(&key).await.unwrap();

    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    let cond = env.status_of(&key).await.status.condition("Synced").cloned().unwrap();
    assert_eq!(cond.status, "False");
    assert!(cond.message.contains("connection reset"), "{}", cond.message);
    assert!(env.object("example.dev/v1", "Gadget", "consumer").await.is_none());
}

#[tokio::test]
async fn missing_composition_is_done() {
    let env = Env::new();
    let key = ObjectKey::new(OAM_API_VERSION, KIND_COMPOSITION, "ns", "nope");
    let res = env.reconciler(Hooks::default()).reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, None);
}

#[tokio::test]
async fn scope_finalizer_blocks_deletion_until_unbound() {
    let env = Env::new();
    env.component("web", widget("Widget")).await;
    let scope_key = ObjectKey::new("example.dev/v1", "HealthScope", "ns", "hs");
    env.store
        .create(Document::from_json(json!({"apiVersion": "example.dev/v1", "kind": "HealthScope", "metadata": {"name": "hs", "namespace": "ns"}, "spec": {}})).unwrap())
        .await
        .unwrap();
    let key = env
        .composition("app", json!([{"componentName": "web", "scopes": [{"scopeRef": {"apiVersion": "example.dev/v1", "kind": "HealthScope", "name": "hs"}}]}]))
        .await;
    let r = env.reconciler(Hooks::default());

    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::ZERO));
    assert_eq!(env.store.get(&key).await.unwrap().finalizers(), vec!["scope.finalizer.core.oam.dev".to_string()]);

    r.reconcile(&key).await.unwrap();
    let members = env.store.get(&scope_key).await.unwrap().get("spec.workloadRefs").unwrap().clone();
    assert_eq!(members, json!([{"apiVersion": "example.dev/v1", "kind": "Widget", "name": "web"}]));

    env.store.delete(&key).await.unwrap();
    env.store.fail_next(Verb::Get, scope_key.clone(), StoreError::Backend("scope store down".into()));
    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    let blocked = env.status_of(&key).await;
    assert!(blocked.is_deleting());
    assert_eq!(blocked.status.condition("Synced").unwrap().status, "False");

    let res = r.reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, None);
    assert!(env.store.get_opt(&key).await.unwrap().is_none());
    assert!(env.object("example.dev/v1", "Widget", "web").await.is_none());
    assert_eq!(env.store.get(&scope_key).await.unwrap().get("spec.workloadRefs").unwrap(), &json!([]));
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
    requeue: Option<Duration>,
}

#[async_trait]
impl Hook for Recorder {
    async fn exec(&self, _comp: &Composition) -> anyhow::Result<Option<Duration>> {
        self.log.lock().unwrap().push(self.name);
        if self.fail { anyhow::bail!("{} refused", self.name) }
        Ok(self.requeue)
    }
}

fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool, requeue: Option<Duration>) -> Arc<dyn Hook> {
    Arc::new(Recorder { name, log: log.clone(), fail, requeue })
}

#[tokio::test]
async fn hooks_run_in_registration_order_and_can_override_requeue() {
    let env = Env::new();
    env.component("web", widget("Widget")).await;
    let key = env.composition("app", json!([{"componentName": "web"}])).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Hooks::default()
        .with_pre("b", recorder("b", &log, false, None))
        .with_pre("a", recorder("a", &log, false, None))
        .with_post("rollout", recorder("rollout", &log, false, Some(Duration::from_secs(5))));

    let res = env.reconciler(hooks).reconcile(&key).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["b", "a", "rollout"]);
    assert_eq!(res.requeue_after, Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn failing_pre_hook_stops_the_pass_but_post_hooks_still_run() {
    let env = Env::new();
    env.component("web", widget("Widget")).await;
    let key = env.composition("app", json!([{"componentName": "web"}])).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Hooks::default().with_pre("gate", recorder("gate", &log, true, None)).with_post("after", recorder("after", &log, false, None));

    let res = env.reconciler(hooks).reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    assert_eq!(*log.lock().unwrap(), vec!["gate", "after"]);
    assert!(env.object("example.dev/v1", "Widget", "web").await.is_none());
    let cond = env.status_of(&key).await.status.condition("Synced").cloned().unwrap();
    assert_eq!(cond.status, "False");
    assert!(cond.message.contains("gate"), "{}", cond.message);
}

#[tokio::test]
async fn failing_post_hook_overrides_success() {
    let env = Env::new();
    env.component("web", widget("Widget")).await;
    let key = env.composition("app", json!([{"componentName": "web"}])).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = Hooks::default().with_post("verify", recorder("verify", &log, true, None));

    let res = env.reconciler(hooks).reconcile(&key).await.unwrap();
    assert_eq!(res.requeue_after, Some(Duration::from_secs(30)));
    assert!(env.object("example.dev/v1", "Widget", "web").await.is_some());
    let cond = env.status_of(&key).await.status.condition("Synced").cloned().unwrap();
    assert_eq!(cond.status, "False");
    assert!(cond.message.contains("verify"));
}
