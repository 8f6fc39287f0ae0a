//! Accessors over raw object JSON and the address of a cluster object.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::ReconcileError;

const MAX_NAME_LEN: usize = 253;

pub fn api_version(v: &Json) -> Option<&str> {
    v.get("apiVersion").and_then(|s| s.as_str())
}

pub fn kind(v: &Json) -> Option<&str> {
    v.get("kind").and_then(|s| s.as_str())
}

pub fn meta_str<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(key)).and_then(|s| s.as_str())
}

pub fn name(v: &Json) -> Option<&str> {
    meta_str(v, "name")
}

pub fn namespace(v: &Json) -> Option<&str> {
    meta_str(v, "namespace")
}

pub fn annotation<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|s| s.as_str())
}

/// Mutable `metadata` map, created if missing. `None` when `v` is not an object.
pub fn metadata_mut(v: &mut Json) -> Option<&mut Map<String, Json>> {
    v.as_object_mut()?.entry("metadata").or_insert_with(|| Json::Object(Map::new())).as_object_mut()
}

/// Status conditions of a live object (empty when absent).
pub fn conditions(v: &Json) -> &[Json] {
    v.get("status").and_then(|s| s.get("conditions")).and_then(|c| c.as_array()).map(Vec::as_slice).unwrap_or(&[])
}

/// Names that can address an object in a REST path. Per-kind rules (DNS labels,
/// the `system:` RBAC names) are left to the API server.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && !name.contains(['/', '%']) && name != "." && name != ".."
}

/// Address of one object: enough for the resolver to find its REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), name: name.into(), namespace: namespace.map(|s| s.to_string()) }
    }

    /// Address of the object a definition describes.
    pub fn from_definition(def: &Json) -> Result<Self, ReconcileError> {
        let api_version = api_version(def).ok_or_else(|| ReconcileError::Definition("definition missing apiVersion".into()))?;
        let kind = kind(def).ok_or_else(|| ReconcileError::Definition("definition missing kind".into()))?;
        let name = name(def).ok_or_else(|| ReconcileError::Definition("definition missing metadata.name".into()))?;
        if !is_valid_name(name) {
            return Err(ReconcileError::Definition(format!("invalid metadata.name: {}", name)));
        }
        Ok(Self::new(api_version, kind, name, namespace(def)))
    }

    /// `(group, version)` split of `apiVersion`; core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn key(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) => format!("{}/{}/{}/{}", self.api_version, self.kind, ns, self.name),
            None => format!("{}/{}/{}", self.api_version, self.kind, self.name),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}
