//! Reconciliation options: the language-agnostic configuration surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use crate::{object, DesiredState, MergeStrategy, ReconcileError, WaitCondition, WaitSpec};

/// Schema validation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidateOptions {
    /// Fail the run on validation findings instead of reporting them as warnings.
    pub fail_on_error: bool,
    /// API version of the schema to validate against (default: the served/storage version).
    pub version: Option<String>,
    /// Also report fields the schema does not declare.
    pub strict: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self { fail_on_error: false, version: None, strict: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileOptions {
    pub state: DesiredState,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub api_version: Option<String>,
    pub kind: Option<String>,
    /// Inline definition: one object, an array of objects, or a `List`.
    pub definition: Option<Json>,
    /// Patch strategies to try in order; empty means the default order.
    pub merge_type: Vec<MergeStrategy>,
    /// Three-way apply using the last-applied annotation.
    pub apply: bool,
    pub append_hash: bool,
    pub wait: bool,
    /// Seconds between wait polls.
    pub wait_sleep: u64,
    /// Seconds before a wait gives up.
    pub wait_timeout: u64,
    pub wait_condition: Option<WaitCondition>,
    pub validate: Option<ValidateOptions>,
    /// Report what would change without writing.
    pub check_mode: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            state: DesiredState::Present,
            name: None,
            namespace: None,
            api_version: None,
            kind: None,
            definition: None,
            merge_type: Vec::new(),
            apply: false,
            append_hash: false,
            wait: false,
            wait_sleep: 5,
            wait_timeout: 120,
            wait_condition: None,
            validate: None,
            check_mode: false,
        }
    }
}

impl ReconcileOptions {
    /// Reject contradictory options. Runs before any cluster call.
    pub fn check(&self) -> Result<(), ReconcileError> {
        if self.apply && !self.merge_type.is_empty() {
            return Err(ReconcileError::Configuration("parameters are mutually exclusive: apply|merge_type".into()));
        }
        if self.wait && self.wait_sleep == 0 {
            return Err(ReconcileError::Configuration("wait_sleep must be at least 1 second".into()));
        }
        Ok(())
    }

    pub fn wait_spec(&self) -> WaitSpec {
        WaitSpec {
            enabled: self.wait,
            timeout: Duration::from_secs(self.wait_timeout),
            poll_interval: Duration::from_secs(self.wait_sleep.max(1)),
            condition: self.wait_condition.clone(),
        }
    }

    /// Definitions to reconcile, with identity fields filled in from the options.
    pub fn definitions(&self) -> Result<Vec<Json>, ReconcileError> {
        let items = match &self.definition {
            Some(Json::Array(items)) => items.clone(),
            Some(def @ Json::Object(map)) => match map.get("items").and_then(|i| i.as_array()) {
                Some(items) if object::kind(def).map_or(false, |k| k.ends_with("List")) => items.clone(),
                _ => vec![def.clone()],
            },
            Some(other) => {
                return Err(ReconcileError::Definition(format!("definition must be an object or a list, got {}", type_name(other))))
            }
            None => {
                let (Some(api_version), Some(kind)) = (self.api_version.as_deref(), self.kind.as_deref()) else {
                    return Err(ReconcileError::Definition("either definition or api_version and kind are required".into()));
                };
                if self.name.is_none() {
                    return Err(ReconcileError::Definition("name is required when no definition is given".into()));
                }
                vec![json!({ "apiVersion": api_version, "kind": kind, "metadata": {} })]
            }
        };
        items.into_iter().map(|item| self.fill_defaults(item)).collect()
    }

    fn fill_defaults(&self, mut def: Json) -> Result<Json, ReconcileError> {
        let obj = def
            .as_object_mut()
            .ok_or_else(|| ReconcileError::Definition("each definition must be an object".into()))?;
        if let Some(v) = &self.api_version {
            obj.entry("apiVersion").or_insert_with(|| json!(v));
        }
        if let Some(k) = &self.kind {
            obj.entry("kind").or_insert_with(|| json!(k));
        }
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if meta.is_null() {
            *meta = Json::Object(Map::new());
        }
        let meta = meta
            .as_object_mut()
            .ok_or_else(|| ReconcileError::Definition("metadata must be an object".into()))?;
        if let Some(n) = &self.name {
            meta.entry("name").or_insert_with(|| json!(n));
        }
        if let Some(ns) = &self.namespace {
            meta.entry("namespace").or_insert_with(|| json!(ns));
        }
        Ok(def)
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}
