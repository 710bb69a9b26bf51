//! Composition (`ApplicationConfiguration`), Component and their status shapes.
//! Field names follow the stored wire format exactly.

use k8s_openapi::chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, OwnerReference, Time};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::TypedReference;

// ---- Composition ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CompositionSpec,
    #[serde(default)]
    pub status: CompositionStatus,
}

impl Composition {
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }
    pub fn uid(&self) -> &str { self.metadata.uid.as_deref().unwrap_or("") }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, f: &str) -> bool {
        self.metadata.finalizers.as_ref().map(|v| v.iter().any(|x| x == f)).unwrap_or(false)
    }

    pub fn add_finalizer(&mut self, f: &str) {
        if !self.has_finalizer(f) { self.metadata.finalizers.get_or_insert_with(Vec::new).push(f.to_string()); }
    }

    pub fn remove_finalizer(&mut self, f: &str) {
        if let Some(v) = self.metadata.finalizers.as_mut() { v.retain(|x| x != f); }
    }

    pub fn uses_scopes(&self) -> bool { self.spec.components.iter().any(|c| !c.scopes.is_empty()) }

    /// Controller owner reference pointing at this composition.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    #[serde(default)]
    pub components: Vec<CompositionComponent>,
}

/// One entry of `spec.components`: a live component or a pinned revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_values: Vec<ParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<ComponentTrait>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<ComponentScope>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_outputs: Vec<DataOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_inputs: Vec<DataInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: ParameterScalar,
}

/// Scalar parameter value; the tag decides whether a string or number is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterScalar {
    Number(serde_json::Number),
    String(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTrait {
    #[serde(rename = "trait")]
    pub trait_: Json,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_outputs: Vec<DataOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_inputs: Vec<DataInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScope {
    pub scope_ref: TypedReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOutput {
    pub name: String,
    #[serde(default)]
    pub field_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_store: Option<StoreReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInput {
    pub value_from: DataInputValueFrom,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_field_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_store: Option<StoreReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInputValueFrom {
    pub data_output_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = "eq")]
    Equal,
    #[serde(rename = "notEq")]
    NotEqual,
    #[serde(rename = "notEmpty")]
    NotEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRequirement {
    #[serde(rename = "op", alias = "operator")]
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    pub field_path: String,
}

/// Intermediate shared document plus the operations that populate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReference {
    pub typed_reference: TypedReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<DataOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataOperator {
    Add,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOperation {
    #[serde(rename = "type", default = "json_patch")]
    pub type_: String,
    #[serde(rename = "op", alias = "operator")]
    pub operator: DataOperator,
    pub to_field_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_data_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionRequirement>,
}

fn json_patch() -> String { "jsonPatch".to_string() }

// ---- Composition status ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<WorkloadStatus>,
    #[serde(default)]
    pub dependency: DependencyStatus,
}

pub const CONDITION_SYNCED: &str = "Synced";
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

impl CompositionStatus {
    /// Upsert by type; transition time moves only when the status flips.
    pub fn set_condition(&mut self, mut c: Condition) {
        match self.conditions.iter_mut().find(|x| x.type_ == c.type_) {
            Some(existing) => {
                if existing.status == c.status { c.last_transition_time = existing.last_transition_time.clone(); }
                *existing = c;
            }
            None => self.conditions.push(c),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> { self.conditions.iter().find(|c| c.type_ == type_) }
}

pub fn reconcile_success() -> Condition {
    synced("True", REASON_RECONCILE_SUCCESS, String::new())
}

pub fn reconcile_error(err: impl std::fmt::Display) -> Condition {
    synced("False", REASON_RECONCILE_ERROR, err.to_string())
}

fn synced(status: &str, reason: &str, message: String) -> Condition {
    Condition {
        type_: CONDITION_SYNCED.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub component_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component_revision_name: String,
    pub reference: TypedReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<WorkloadTrait>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<WorkloadScope>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTrait {
    pub reference: TypedReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadScope {
    pub reference: TypedReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsatisfied: Vec<UnsatisfiedDependency>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsatisfiedDependency {
    pub reason: String,
    pub from: DependencyFrom,
    pub to: DependencyTo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyFrom {
    pub reference: TypedReference,
    pub field_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTo {
    pub reference: TypedReference,
    #[serde(default)]
    pub field_paths: Vec<String>,
}

// ---- Component ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ComponentSpec,
    #[serde(default)]
    pub status: ComponentStatus,
}

impl Component {
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }

    pub fn latest_revision_name(&self) -> &str {
        self.status.latest_revision.as_ref().map(|r| r.name.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default)]
    pub workload: Json,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ComponentParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParameter {
    pub name: String,
    #[serde(default)]
    pub field_paths: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Pointer to a revision snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub name: String,
    pub revision: i64,
}
