//! Path-addressable JSON document. Renderer and dependency evaluator only touch
//! objects through this type.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::path::{self, PathError, Segment};
use crate::{ObjectKey, TypedReference};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Json);

impl Document {
    /// Wrap a JSON object. Anything other than an object is a type mismatch.
    pub fn from_json(v: Json) -> Result<Self, PathError> {
        match v {
            Json::Object(_) => Ok(Self(v)),
            _ => Err(PathError::TypeMismatch { path: String::new(), expected: "object" }),
        }
    }

    pub fn empty() -> Self { Self(Json::Object(Map::new())) }

    pub fn encode<T: Serialize>(v: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_value(v)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }

    pub fn as_json(&self) -> &Json { &self.0 }
    pub fn into_json(self) -> Json { self.0 }

    pub fn get(&self, path: &str) -> Result<&Json, PathError> {
        let segs = path::parse(path)?;
        let mut cur = &self.0;
        for seg in &segs {
            cur = match (seg, cur) {
                (Segment::Field(f), Json::Object(m)) => m.get(f),
                (Segment::Index(i), Json::Array(a)) => a.get(*i),
                (_, Json::Null) => None,
                (Segment::Field(_), _) => return Err(mismatch(path, "object")),
                (Segment::Index(_), _) => return Err(mismatch(path, "array")),
            }
            .ok_or_else(|| PathError::PathNotFound(path.to_string()))?;
        }
        Ok(cur)
    }

    pub fn get_string(&self, path: &str) -> Result<&str, PathError> {
        self.get(path)?.as_str().ok_or_else(|| mismatch(path, "string"))
    }

    pub fn set(&mut self, path: &str, value: Json) -> Result<(), PathError> {
        let segs = path::parse(path)?;
        set_in(&mut self.0, &segs, value, path)
    }

    pub fn set_string(&mut self, path: &str, value: &str) -> Result<(), PathError> {
        self.set(path, Json::String(value.to_string()))
    }

    pub fn set_number(&mut self, path: &str, value: serde_json::Number) -> Result<(), PathError> {
        self.set(path, Json::Number(value))
    }

    /// Remove the value at `path`; a missing path is not an error.
    pub fn remove(&mut self, path: &str) -> Result<Option<Json>, PathError> {
        let mut segs = path::parse(path)?;
        let last = segs.pop().ok_or_else(|| PathError::PathNotFound(path.to_string()))?;
        let mut cur = &mut self.0;
        for seg in &segs {
            let next = match (seg, cur) {
                (Segment::Field(f), Json::Object(m)) => m.get_mut(f),
                (Segment::Index(i), Json::Array(a)) => a.get_mut(*i),
                _ => None,
            };
            match next { Some(n) => cur = n, None => return Ok(None) }
        }
        Ok(match (last, cur) {
            (Segment::Field(f), Json::Object(m)) => m.remove(&f),
            (Segment::Index(i), Json::Array(a)) if i < a.len() => Some(a.remove(i)),
            _ => None,
        })
    }

    // ---- metadata helpers ----

    fn str_at(&self, path: &str) -> &str { self.get_string(path).unwrap_or("") }

    pub fn api_version(&self) -> &str { self.str_at("apiVersion") }
    pub fn kind(&self) -> &str { self.str_at("kind") }
    pub fn name(&self) -> &str { self.str_at("metadata.name") }
    pub fn namespace(&self) -> &str { self.str_at("metadata.namespace") }
    pub fn uid(&self) -> &str { self.str_at("metadata.uid") }
    pub fn resource_version(&self) -> &str { self.str_at("metadata.resourceVersion") }

    pub fn set_name(&mut self, name: &str) { let _ = self.set_string("metadata.name", name); }
    pub fn set_namespace(&mut self, ns: &str) { let _ = self.set_string("metadata.namespace", ns); }

    pub fn generation(&self) -> i64 { self.get("metadata.generation").ok().and_then(|v| v.as_i64()).unwrap_or(0) }

    pub fn labels(&self) -> BTreeMap<String, String> { self.string_map("metadata.labels") }
    pub fn annotations(&self) -> BTreeMap<String, String> { self.string_map("metadata.annotations") }

    fn string_map(&self, path: &str) -> BTreeMap<String, String> {
        match self.get(path) {
            Ok(Json::Object(m)) => m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let _ = self.set(&format!("metadata.labels['{}']", key), Json::String(value.to_string()));
    }

    /// Merge `extra` labels/annotations in; keys already present on the object win.
    pub fn pass_through(&mut self, labels: &BTreeMap<String, String>, annotations: &BTreeMap<String, String>) {
        for (field, extra) in [("labels", labels), ("annotations", annotations)] {
            if extra.is_empty() { continue; }
            let path = format!("metadata.{}", field);
            let mut merged = self.string_map(&path);
            for (k, v) in extra { merged.entry(k.clone()).or_insert_with(|| v.clone()); }
            let _ = self.set(&path, serde_json::to_value(merged).unwrap_or(Json::Null));
        }
    }

    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.get("metadata.ownerReferences")
            .ok()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// UID of the controlling owner, if any.
    pub fn controller_uid(&self) -> Option<String> {
        self.owner_references().into_iter().find(|o| o.controller == Some(true)).map(|o| o.uid)
    }

    /// Replace any controller reference with `owner`, keeping non-controller owners.
    pub fn set_controller(&mut self, owner: &OwnerReference) {
        let mut refs: Vec<OwnerReference> = self.owner_references().into_iter().filter(|o| o.controller != Some(true) && o.uid != owner.uid).collect();
        refs.push(owner.clone());
        let _ = self.set("metadata.ownerReferences", serde_json::to_value(refs).unwrap_or(Json::Null));
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.get("metadata.finalizers").ok().and_then(|v| serde_json::from_value(v.clone()).ok()).unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool { self.get("metadata.deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false) }

    pub fn typed_reference(&self) -> TypedReference {
        TypedReference {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }
}

fn mismatch(path: &str, expected: &'static str) -> PathError {
    PathError::TypeMismatch { path: path.to_string(), expected }
}

/// Setting past the end pads with `null`, but never by more than this many slots.
pub const MAX_ARRAY_PADDING: usize = 1024;

fn set_in(cur: &mut Json, segs: &[Segment], value: Json, path: &str) -> Result<(), PathError> {
    let Some((head, rest)) = segs.split_first() else {
        *cur = value;
        return Ok(());
    };
    match head {
        Segment::Field(f) => {
            if cur.is_null() { *cur = Json::Object(Map::new()); }
            let m = cur.as_object_mut().ok_or_else(|| mismatch(path, "object"))?;
            let next = m.entry(f.clone()).or_insert(Json::Null);
            set_in(next, rest, value, path)
        }
        Segment::Index(i) => {
            if cur.is_null() { *cur = Json::Array(Vec::new()); }
            let a = cur.as_array_mut().ok_or_else(|| mismatch(path, "array"))?;
            if a.len() <= *i {
                if *i - a.len() > MAX_ARRAY_PADDING {
                    return Err(PathError::InvalidPath { path: path.to_string(), reason: "array index too far past the end" });
                }
                a.resize(*i + 1, Json::Null);
            }
            set_in(&mut a[*i], rest, value, path)
        }
    }
}

/// Deep-merge `patch` into `base`: objects merge key-wise, anything else replaces.
pub fn merge_json(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            for (k, v) in p {
                match b.get_mut(k) {
                    Some(existing) => merge_json(existing, v),
                    None => { b.insert(k.clone(), v.clone()); }
                }
            }
        }
        (b, p) => *b = p.clone(),
    }
}
