#![forbid(unsafe_code)]

use keel_core::{Document, LabelSelector, ObjectKey, ObjectStore, StoreError};
use keel_store::{MemStore, Verb};
use serde_json::json;

fn obj(kind: &str, name: &str, extra: serde_json::Value) -> Document {
    let mut v = json!({"apiVersion": "example.dev/v1", "kind": kind, "metadata": {"name": name, "namespace": "ns"}});
    keel_core::merge_json(&mut v, &extra);
    Document::from_json(v).unwrap()
}

#[tokio::test]
async fn create_assigns_identity_and_rejects_duplicates() {
    let s = MemStore::new();
    let created = s.create(obj("Widget", "a", json!({}))).await.unwrap();
    assert!(!created.uid().is_empty());
    assert_eq!(created.generation(), 1);
    let err = s.create(obj("Widget", "a", json!({}))).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn stale_resource_version_conflicts() {
    let s = MemStore::new();
    let first = s.create(obj("Widget", "a", json!({"spec": {"n": 1}}))).await.unwrap();
    let mut second = first.clone();
    second.set("spec.n", json!(2)).unwrap();
    let updated = s.update(second).await.unwrap();
    assert_eq!(updated.generation(), 2);

    let mut stale = first;
    stale.set("spec.n", json!(3)).unwrap();
    assert!(matches!(s.update(stale).await, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn status_is_a_separate_subresource() {
    let s = MemStore::new();
    let created = s.create(obj("Widget", "a", json!({"spec": {"n": 1}}))).await.unwrap();
    let mut with_status = created.clone();
    with_status.set_string("status.phase", "Ready").unwrap();
    s.update_status(with_status).await.unwrap();

    // a spec write without status must not wipe it, and does not bump generation when spec is equal
    let mut spec_only = obj("Widget", "a", json!({"spec": {"n": 1}}));
    spec_only.set_label("x", "y");
    let after = s.update(spec_only).await.unwrap();
    assert_eq!(after.get_string("status.phase").unwrap(), "Ready");
    assert_eq!(after.generation(), 1);
}

#[tokio::test]
async fn list_filters_by_namespace_kind_and_labels() {
    let s = MemStore::new();
    s.create(obj("Widget", "a", json!({"metadata": {"labels": {"app": "x"}}}))).await.unwrap();
    s.create(obj("Widget", "b", json!({"metadata": {"labels": {"app": "y"}}}))).await.unwrap();
    s.create(obj("Gadget", "c", json!({"metadata": {"labels": {"app": "x"}}}))).await.unwrap();
    let got = s.list("example.dev/v1", "Widget", "ns", &LabelSelector::of("app", "x")).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].name(), "a");
    assert!(s.list("example.dev/v1", "Widget", "other", &LabelSelector::everything()).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_cascades_to_owned_objects() {
    let s = MemStore::new();
    let owner = s.create(obj("Owner", "o", json!({}))).await.unwrap();
    let child = obj("Widget", "child", json!({"metadata": {"ownerReferences": [
        {"apiVersion": "example.dev/v1", "kind": "Owner", "name": "o", "uid": owner.uid(), "controller": true}
    ]}}));
    s.create(child).await.unwrap();
    s.create(obj("Widget", "free", json!({}))).await.unwrap();
    s.delete(&owner.key()).await.unwrap();
    assert_eq!(s.len(), 1);
    assert_eq!(s.objects_of("Widget")[0].name(), "free");
}

#[tokio::test]
async fn finalizers_block_removal_until_cleared() {
    let s = MemStore::new();
    let created = s.create(obj("Widget", "a", json!({"metadata": {"finalizers": ["f"]}}))).await.unwrap();
    s.delete(&created.key()).await.unwrap();
    let marked = s.get(&created.key()).await.unwrap();
    assert!(marked.is_deleting());

    let mut cleared = marked;
    cleared.set("metadata.finalizers", json!([])).unwrap();
    s.update(cleared).await.unwrap();
    assert!(s.get(&created.key()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn injected_failures_fire_once() {
    let s = MemStore::new();
    let key = ObjectKey::new("example.dev/v1", "Widget", "ns", "a");
    s.fail_next(Verb::Get, key.clone(), StoreError::Backend("down".into()));
    assert!(matches!(s.get(&key).await, Err(StoreError::Backend(_))));
    assert!(s.get(&key).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn epoch_advances_on_writes() {
    let s = MemStore::new();
    let rx = s.subscribe_epoch();
    s.create(obj("Widget", "a", json!({}))).await.unwrap();
    assert_eq!(*rx.borrow(), 1);
}
