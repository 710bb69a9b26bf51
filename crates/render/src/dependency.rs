//! Data-flow dependencies between rendered objects.
//!
//! The graph is rebuilt on every pass: outputs register their source object and
//! field path by name, then each consumer's inputs are resolved against live
//! objects. A source that is missing or not yet ready yields an
//! [`UnsatisfiedDependency`] and leaves the consumer unrendered; chains converge
//! one hop per pass.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::model::{
    ConditionOperator, ConditionRequirement, DataInput, DataOperation, DataOperator, DataOutput, DependencyFrom, DependencyTo,
    StoreReference, UnsatisfiedDependency,
};
use keel_core::{merge_json, Document, ObjectStore, PathError, RenderError, TypedReference};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as Json};
use tracing::debug;

/// Where a named output reads its value from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub reference: TypedReference,
    pub field_path: String,
    pub conditions: Vec<ConditionRequirement>,
    pub store: Option<StoreReference>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    sources: FxHashMap<String, SourceInfo>,
}

impl DependencyGraph {
    pub fn register(&mut self, output: &DataOutput, reference: TypedReference) -> Result<(), RenderError> {
        if self.sources.contains_key(&output.name) {
            return Err(RenderError::DuplicateDataOutput(output.name.clone()));
        }
        self.sources.insert(
            output.name.clone(),
            SourceInfo {
                reference,
                field_path: output.field_path.clone(),
                conditions: output.conditions.clone(),
                store: output.output_store.clone(),
            },
        );
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceInfo> { self.sources.get(name) }
    pub fn len(&self) -> usize { self.sources.len() }
    pub fn is_empty(&self) -> bool { self.sources.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

/// Evaluate conditions against a source object. With no conditions the value
/// must be non-empty.
pub fn check_readiness(conds: &[ConditionRequirement], value: &str, obj: &Document) -> Readiness {
    if conds.is_empty() {
        return if value.is_empty() { Readiness::NotReady("value should not be empty".into()) } else { Readiness::Ready };
    }
    for c in conds {
        let got = match c.field_path.as_deref().filter(|p| !p.is_empty()) {
            Some(fp) => match condition_operand(obj, fp) {
                Some(v) => v,
                None => return Readiness::NotReady(format!("field path {} not found", fp)),
            },
            None => value.to_string(),
        };
        let expected = match c.value_from.as_ref().filter(|v| !v.field_path.is_empty()) {
            Some(vf) => match condition_operand(obj, &vf.field_path) {
                Some(v) => v,
                None => return Readiness::NotReady(format!("field path {} not found", vf.field_path)),
            },
            None => c.value.clone().unwrap_or_default(),
        };
        let ok = match c.operator {
            ConditionOperator::Equal => got == expected,
            ConditionOperator::NotEqual => got != expected,
            ConditionOperator::NotEmpty => !got.is_empty(),
        };
        if !ok {
            let reason = match c.operator {
                ConditionOperator::Equal => format!("got({}) expected to be {}", got, expected),
                ConditionOperator::NotEqual => format!("got({}) expected not to be {}", got, expected),
                ConditionOperator::NotEmpty => "value should not be empty".to_string(),
            };
            return Readiness::NotReady(reason);
        }
    }
    Readiness::Ready
}

/// Scalars compare by their textual form; objects and arrays never match.
fn condition_operand(obj: &Document, path: &str) -> Option<String> {
    match obj.get(path).ok()? {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Null => None,
        other => Some(other.to_string()),
    }
}

/// Apply one store operation to the store document.
pub fn apply_operation(doc: &mut Document, op: &DataOperation, value: Json) -> Result<(), PathError> {
    let Some(sub) = op.to_data_path.as_deref().filter(|p| !p.is_empty()) else {
        return write(doc, &op.to_field_path, op.operator, value);
    };
    // the field at toFieldPath holds a JSON-encoded document
    let inner = match doc.get(&op.to_field_path) {
        Ok(Json::String(s)) if !s.trim().is_empty() => serde_json::from_str(s)
            .map_err(|_| PathError::TypeMismatch { path: op.to_field_path.clone(), expected: "JSON document" })?,
        Ok(Json::String(_)) | Ok(Json::Null) | Err(PathError::PathNotFound(_)) => Json::Object(Map::new()),
        Ok(_) => return Err(PathError::TypeMismatch { path: op.to_field_path.clone(), expected: "string" }),
        Err(e) => return Err(e),
    };
    let mut inner = Document::from_json(inner).map_err(|_| PathError::TypeMismatch { path: op.to_field_path.clone(), expected: "JSON object" })?;
    write(&mut inner, sub, op.operator, value)?;
    doc.set_string(&op.to_field_path, &inner.as_json().to_string())
}

fn write(doc: &mut Document, path: &str, operator: DataOperator, value: Json) -> Result<(), PathError> {
    match operator {
        DataOperator::Add => doc.set(path, value),
        DataOperator::Merge => {
            let mut cur = doc.get(path).cloned().unwrap_or(Json::Null);
            merge_json(&mut cur, &value);
            doc.set(path, cur)
        }
    }
}

/// Reads live sources from the store and fills consumers.
pub struct DependencyEvaluator<'a> {
    store: &'a dyn ObjectStore,
    namespace: &'a str,
    owner: &'a OwnerReference,
}

impl<'a> DependencyEvaluator<'a> {
    pub fn new(store: &'a dyn ObjectStore, namespace: &'a str, owner: &'a OwnerReference) -> Self {
        Self { store, namespace, owner }
    }

    /// Resolve `inputs` into `dest`. Stops at the first unready input and
    /// reports it; the caller must then leave `dest` unapplied this pass.
    pub async fn fill_inputs(&self, graph: &DependencyGraph, inputs: &[DataInput], dest: &mut Document) -> Result<Option<UnsatisfiedDependency>, RenderError> {
        for input in inputs {
            let name = &input.value_from.data_output_name;
            let src = graph.source(name).ok_or_else(|| RenderError::DataOutputNotExist(name.clone()))?;
            let to = DependencyTo { reference: dest.typed_reference(), field_paths: input.to_field_paths.clone() };
            let pending = |reason: String| UnsatisfiedDependency {
                reason,
                from: DependencyFrom { reference: src.reference.clone(), field_path: src.field_path.clone() },
                to: to.clone(),
            };

            let (value, source) = match self.source_value(src).await? {
                Ok(v) => v,
                Err(reason) => return Ok(Some(pending(reason))),
            };
            let mut conds = src.conditions.clone();
            conds.extend(input.conditions.iter().cloned());
            if let Readiness::NotReady(reason) = check_readiness(&conds, &value, &source) {
                debug!(output = %name, source = %src.reference.name, %reason, "data output not ready");
                return Ok(Some(pending(reason)));
            }

            if let Some(out_store) = &src.store {
                if let Readiness::NotReady(reason) = self.apply_store(out_store, &value, &source).await? {
                    return Ok(Some(pending(reason)));
                }
            }
            match &input.input_store {
                Some(in_store) => {
                    if let Readiness::NotReady(reason) = self.apply_store(in_store, &value, &source).await? {
                        return Ok(Some(pending(reason)));
                    }
                }
                None => {
                    for path in &input.to_field_paths {
                        dest.set_string(path, &value)?;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Outer error aborts the pass; inner `Err(reason)` means not ready yet.
    async fn source_value(&self, src: &SourceInfo) -> Result<Result<(String, Document), String>, RenderError> {
        let key = src.reference.key(self.namespace);
        let obj = match self.store.get(&key).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => return Ok(Err(format!("source object {} not found", key))),
            Err(e) => return Err(e.into()),
        };
        match obj.get(&src.field_path) {
            Ok(Json::String(s)) => {
                let s = s.clone();
                Ok(Ok((s, obj)))
            }
            Ok(Json::Null) | Err(PathError::PathNotFound(_)) => Ok(Err(format!("field path {} not found in {}", src.field_path, key))),
            // an intermediate that is not yet an object or array, e.g. status still a plain string
            Err(PathError::TypeMismatch { expected, .. }) => {
                Ok(Err(format!("field path {} not found in {}: an intermediate is not {}", src.field_path, key, expected)))
            }
            Ok(other) => Err(RenderError::UnsupportedValueType { object: key.to_string(), field_path: src.field_path.clone(), found: json_type(other) }),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_store(&self, sref: &StoreReference, value: &str, source: &Document) -> Result<Readiness, RenderError> {
        let key = sref.typed_reference.key(self.namespace);
        let existing = self.store.get_opt(&key).await?;
        let mut doc = match &existing {
            Some(d) => d.clone(),
            None => {
                let mut d = Document::empty();
                d.set_string("apiVersion", &key.api_version)?;
                d.set_string("kind", &key.kind)?;
                d.set_name(&key.name);
                d.set_namespace(&key.namespace);
                d.set_controller(self.owner);
                d
            }
        };
        for op in &sref.operations {
            if let Readiness::NotReady(reason) = check_readiness_or_ready(&op.conditions, value, source) {
                return Ok(Readiness::NotReady(reason));
            }
            let v = match (&op.value_from, &op.value) {
                (Some(vf), _) if !vf.field_path.is_empty() => match source.get(&vf.field_path) {
                    Ok(v) if !v.is_null() => v.clone(),
                    _ => return Ok(Readiness::NotReady(format!("field path {} not found", vf.field_path))),
                },
                (_, Some(v)) => v.clone(),
                _ => Json::String(value.to_string()),
            };
            apply_operation(&mut doc, op, v)?;
        }
        match existing {
            Some(before) if before == doc => {}
            Some(_) => { self.store.update(doc).await?; }
            None => { self.store.create(doc).await?; }
        }
        debug!(store = %key, ops = sref.operations.len(), "data store updated");
        Ok(Readiness::Ready)
    }
}

/// Operation conditions are optional: none means the operation always applies.
fn check_readiness_or_ready(conds: &[ConditionRequirement], value: &str, obj: &Document) -> Readiness {
    if conds.is_empty() { Readiness::Ready } else { check_readiness(conds, value, obj) }
}

fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
