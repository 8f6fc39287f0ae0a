//! Rekon schema: validate definitions against the `openAPIV3Schema` of the CRD that serves them.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kube::{api::ListParams, Api, Client};
use rekon_core::{object, ValidationIssue, Validator};
use serde_json::{Map, Value as Json};
use tracing::debug;

/// Fetches CRD schemas from the cluster and checks definitions against them.
pub struct SchemaValidator {
    client: Client,
    // (group, kind) -> CRD as JSON
    crds: Mutex<HashMap<(String, String), Json>>,
}

impl SchemaValidator {
    pub fn new(client: Client) -> Self {
        Self { client, crds: Mutex::new(HashMap::new()) }
    }

    pub async fn connect() -> Result<Self> {
        Ok(Self::new(rekon_kubehub::get_kube_client().await?))
    }

    async fn fetch_crd(&self, group: &str, kind: &str) -> Result<Option<Json>> {
        let key = (group.to_string(), kind.to_string());
        if let Some(hit) = self.crds.lock().ok().and_then(|m| m.get(&key).cloned()) {
            return Ok(Some(hit));
        }
        // List and match on group + kind; the CRD name needs the plural, which we do not know.
        let api: Api<apiextv1::CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api.list(&ListParams::default()).await.context("listing CustomResourceDefinitions")?;
        let Some(crd) = crds.into_iter().find(|c| c.spec.group == group && c.spec.names.kind == kind) else {
            return Ok(None);
        };
        let v = serde_json::to_value(&crd).context("serializing CustomResourceDefinition")?;
        if let Ok(mut m) = self.crds.lock() {
            m.insert(key, v.clone());
        }
        Ok(Some(v))
    }
}

#[async_trait::async_trait]
impl Validator for SchemaValidator {
    async fn validate(&self, definition: &Json, version: Option<&str>, strict: bool) -> Result<Vec<ValidationIssue>> {
        let api_version = object::api_version(definition).ok_or_else(|| anyhow!("definition missing apiVersion"))?;
        let kind = object::kind(definition).ok_or_else(|| anyhow!("definition missing kind"))?;
        let (group, def_version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
        if group.is_empty() {
            return Err(anyhow!("no CRD schema for built-in kind {}/{}", api_version, kind));
        }
        let crd = self
            .fetch_crd(group, kind)
            .await?
            .ok_or_else(|| anyhow!("no CustomResourceDefinition serves {} in group {}", kind, group))?;
        let (chosen, schema) = select_version(&crd, version, def_version)?;
        let schema = schema.ok_or_else(|| anyhow!("CRD for {} has no openAPIV3Schema for version {}", kind, chosen))?;
        debug!(kind, version = %chosen, strict, "validating against CRD schema");

        #[allow(unused_mut)]
        let mut issues = check_against_schema(definition, schema, strict);
        #[cfg(feature = "jsonschema-validate")]
        for extra in full::evaluate(definition, schema)? {
            if !issues.iter().any(|i| i.path == extra.path) {
                issues.push(extra);
            }
        }
        Ok(issues)
    }
}

/// Pick the schema version to validate against and return it with its schema.
///
/// An explicitly requested version must be defined by the CRD. Otherwise the
/// definition's own version is used when served, then the storage version.
pub fn select_version<'a>(crd: &'a Json, requested: Option<&str>, def_version: &str) -> Result<(String, Option<&'a Json>)> {
    let versions = crd.pointer("/spec/versions").and_then(Json::as_array).map(Vec::as_slice).unwrap_or_default();
    let named = |name: &str| versions.iter().find(|v| v.get("name").and_then(Json::as_str) == Some(name));
    let flag = |v: &Json, key: &str| v.get(key).and_then(Json::as_bool).unwrap_or(false);

    let chosen = match requested {
        Some(req) => named(req).ok_or_else(|| anyhow!("version {} is not defined by the CRD", req))?,
        None => match named(def_version).filter(|v| flag(*v, "served")) {
            Some(v) => v,
            None => versions
                .iter()
                .find(|v| flag(*v, "storage"))
                .or_else(|| versions.iter().find(|v| flag(*v, "served")))
                .ok_or_else(|| anyhow!("CRD serves no versions"))?,
        },
    };
    let name = chosen.get("name").and_then(Json::as_str).unwrap_or(def_version).to_string();
    let schema = chosen
        .pointer("/schema/openAPIV3Schema")
        .or_else(|| crd.pointer("/spec/validation/openAPIV3Schema"));
    Ok((name, schema))
}

/// Structural check of `def` against an OpenAPI v3 schema: types, required
/// fields, enums, and (when `strict`) fields the schema does not declare.
pub fn check_against_schema(def: &Json, schema: &Json, strict: bool) -> Vec<ValidationIssue> {
    let mut out = Vec::new();
    walk(def, schema, "", strict, true, &mut out);
    out
}

fn walk(v: &Json, schema: &Json, path: &str, strict: bool, resource: bool, out: &mut Vec<ValidationIssue>) {
    if v.is_null() && schema.get("nullable").and_then(Json::as_bool) == Some(true) {
        return;
    }
    let int_or_string = schema.get("x-kubernetes-int-or-string").and_then(Json::as_bool) == Some(true);
    if int_or_string {
        if !(v.is_string() || v.is_i64() || v.is_u64()) {
            out.push(issue(path, format!("expected integer or string, got {}", type_name(v)), "mismatched type"));
            return;
        }
    } else if let Some(ty) = schema.get("type").and_then(Json::as_str) {
        if !type_matches(ty, v) {
            out.push(issue(path, format!("expected {}, got {}", ty, type_name(v)), "mismatched type"));
            return;
        }
    }
    if let Some(allowed) = schema.get("enum").and_then(Json::as_array) {
        if !allowed.contains(v) {
            out.push(issue(path, format!("value {} is not one of {}", v, Json::Array(allowed.clone())), "value not in allowed set"));
        }
    }

    match v {
        Json::Object(map) => walk_object(map, schema, path, strict, resource, out),
        Json::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    walk(item, item_schema, &format!("{}/{}", path, i), strict, false, out);
                }
            }
        }
        _ => {}
    }
}

fn walk_object(map: &Map<String, Json>, schema: &Json, path: &str, strict: bool, resource: bool, out: &mut Vec<ValidationIssue>) {
    let embedded = resource || schema.get("x-kubernetes-embedded-resource").and_then(Json::as_bool) == Some(true);
    for req in schema.get("required").and_then(Json::as_array).into_iter().flatten().filter_map(Json::as_str) {
        if !map.contains_key(req) {
            out.push(issue(&child(path, req), format!("missing required field {}", req), "missing required field"));
        }
    }

    let props = schema.get("properties").and_then(Json::as_object);
    let additional = schema.get("additionalProperties");
    let open = schema.get("x-kubernetes-preserve-unknown-fields").and_then(Json::as_bool) == Some(true)
        || additional == Some(&Json::Bool(true));
    for (k, value) in map {
        if embedded && matches!(k.as_str(), "apiVersion" | "kind" | "metadata") {
            continue;
        }
        let at = child(path, k);
        match (props.and_then(|p| p.get(k)), additional) {
            (Some(s), _) => walk(value, s, &at, strict, false, out),
            (None, Some(s @ Json::Object(_))) => walk(value, s, &at, strict, false, out),
            (None, _) if strict && !open => out.push(issue(&at, format!("unknown field {}", k), "field is not declared in the schema")),
            _ => {}
        }
    }
}

fn type_matches(ty: &str, v: &Json) -> bool {
    match ty {
        "object" => v.is_object(),
        "array" => v.is_array(),
        "string" => v.is_string(),
        "integer" => v.is_i64() || v.is_u64(),
        "number" => v.is_number(),
        "boolean" => v.is_boolean(),
        _ => true,
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(n) if n.is_f64() => "number",
        Json::Number(_) => "integer",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// JSON pointer segment (RFC 6901 escaping).
fn child(path: &str, key: &str) -> String {
    format!("{}/{}", path, key.replace('~', "~0").replace('/', "~1"))
}

fn issue(path: &str, error: String, hint: &str) -> ValidationIssue {
    ValidationIssue { path: path.to_string(), error, hint: Some(hint.to_string()) }
}

#[cfg(feature = "jsonschema-validate")]
mod full {
    use anyhow::{anyhow, Result};
    use jsonschema::{Draft, JSONSchema};
    use rekon_core::ValidationIssue;
    use serde_json::Value as Json;

    /// Full JSON Schema evaluation of `def`.
    pub(crate) fn evaluate(def: &Json, schema: &Json) -> Result<Vec<ValidationIssue>> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| anyhow!("compiling CRD JSON Schema: {}", e))?;
        let issues = match compiled.validate(def) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|err| {
                    let error = err.to_string();
                    let hint = if error.contains("required property") {
                        Some("missing required field".into())
                    } else if error.contains("is not of type") {
                        Some("mismatched type".into())
                    } else if error.contains("is not one of") {
                        Some("value not in allowed set".into())
                    } else {
                        None
                    };
                    ValidationIssue { path: err.instance_path.to_string(), error, hint }
                })
                .collect(),
        };
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crd() -> Json {
        let schema = |replicas_type: &str| {
            json!({
                "type": "object",
                "properties": {
                    "spec": {
                        "type": "object",
                        "required": ["size"],
                        "properties": {
                            "size": {"type": replicas_type},
                            "tier": {"type": "string", "enum": ["gold", "silver"]},
                            "port": {"x-kubernetes-int-or-string": true},
                            "labels": {"type": "object", "additionalProperties": {"type": "string"}},
                            "extra": {"type": "object", "x-kubernetes-preserve-unknown-fields": true},
                            "hosts": {"type": "array", "items": {"type": "object", "properties": {"name": {"type": "string"}}}}
                        }
                    },
                    "status": {"type": "object", "nullable": true}
                }
            })
        };
        json!({
            "spec": {
                "group": "example.com",
                "names": {"kind": "Cache"},
                "versions": [
                    {"name": "v1alpha1", "served": true, "storage": false, "schema": {"openAPIV3Schema": schema("string")}},
                    {"name": "v1", "served": true, "storage": true, "schema": {"openAPIV3Schema": schema("integer")}},
                    {"name": "v0", "served": false, "storage": false}
                ]
            }
        })
    }

    fn cache(spec: Json) -> Json {
        json!({"apiVersion": "example.com/v1", "kind": "Cache", "metadata": {"name": "c", "labels": {"a": "b"}}, "spec": spec})
    }

    fn schema_v1() -> Json {
        let crd = crd();
        select_version(&crd, None, "v1").unwrap().1.cloned().unwrap()
    }

    #[test]
    fn version_selection() {
        let crd = crd();
        assert_eq!(select_version(&crd, None, "v1alpha1").unwrap().0, "v1alpha1");
        // unserved definition version falls back to storage
        assert_eq!(select_version(&crd, None, "v0").unwrap().0, "v1");
        assert_eq!(select_version(&crd, None, "v9").unwrap().0, "v1");
        assert_eq!(select_version(&crd, Some("v1alpha1"), "v1").unwrap().0, "v1alpha1");
        assert!(select_version(&crd, Some("v2"), "v1").is_err());
        let (_, schema) = select_version(&crd, Some("v0"), "v1").unwrap();
        assert!(schema.is_none());
    }

    #[test]
    fn valid_definition_has_no_issues() {
        let def = cache(json!({"size": 3, "tier": "gold", "port": "http", "labels": {"team": "a"},
                               "extra": {"anything": [1, 2]}, "hosts": [{"name": "a"}]}));
        assert_eq!(check_against_schema(&def, &schema_v1(), true), vec![]);
    }

    #[test]
    fn reports_type_enum_and_required() {
        let issues = check_against_schema(&cache(json!({"size": "three", "tier": "bronze", "port": 1.5})), &schema_v1(), true);
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/spec/port", "/spec/size", "/spec/tier"]);
        assert!(issues[1].error.contains("expected integer, got string"));

        let issues = check_against_schema(&cache(json!({"tier": "gold"})), &schema_v1(), false);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/spec/size");
        assert_eq!(issues[0].hint.as_deref(), Some("missing required field"));
    }

    #[test]
    fn unknown_fields_only_in_strict_mode() {
        let def = cache(json!({"size": 1, "replicas": 2, "hosts": [{"name": "a", "weight": 1}]}));
        let issues = check_against_schema(&def, &schema_v1(), true);
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/spec/hosts/0/weight", "/spec/replicas"]);
        assert!(check_against_schema(&def, &schema_v1(), false).is_empty());
    }

    #[test]
    fn nullable_and_pointer_escaping() {
        let mut def = cache(json!({"size": 1, "labels": {"x/y": 1}}));
        def["status"] = Json::Null;
        let issues = check_against_schema(&def, &schema_v1(), true);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/spec/labels/x~1y");
    }
}
