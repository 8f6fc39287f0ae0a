//! Three-way apply: desired vs. live vs. the last definition this tool applied.
//!
//! The last-applied definition is stored on the object itself, in the
//! annotation kubectl uses, so fields removed from a definition since the last
//! apply can be removed from the cluster while fields other actors added are kept.

use rekon_core::object;
use serde_json::{json, Map, Value as Json};

use crate::canonical_json;
use crate::keys::merge_key;
use crate::patch::{self, all_keyed, is_empty_container, json_eq, lists_match, managed, non_empty, without_nulls};

pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

static EMPTY: Json = Json::Null;

/// `desired` with the last-applied annotation set to its own canonical form.
///
/// Top-level `status` is never recorded: it is not ours to manage.
pub fn annotate(desired: &Json) -> Json {
    let record = canonical_json(&without_annotation(&managed(desired)));
    let mut out = desired.clone();
    if let Some(meta) = object::metadata_mut(&mut out) {
        let annotations = meta.entry("annotations").or_insert_with(|| json!({}));
        if !annotations.is_object() {
            *annotations = json!({});
        }
        if let Some(a) = annotations.as_object_mut() {
            a.insert(LAST_APPLIED_ANNOTATION.to_string(), Json::String(record));
        }
    }
    out
}

/// Definition recorded on the live object by the previous apply.
pub fn last_applied(live: &Json) -> Option<Json> {
    object::annotation(live, LAST_APPLIED_ANNOTATION).and_then(|s| serde_json::from_str(s).ok())
}

/// Merge patch moving `live` to `desired`, or `None` when nothing changes.
///
/// Without a recorded last-applied definition this falls back to a two-way
/// merge diff; the patch still records the annotation for the next run.
pub fn apply_patch(desired: &Json, live: &Json) -> Option<Json> {
    let kind = object::kind(desired).unwrap_or_default();
    let desired = annotate(&managed(desired));
    let Some(last) = last_applied(live) else {
        return patch::merge_delta(&desired, live, &mut Vec::new(), kind, false);
    };
    let last = annotate(&last);
    let mut out = deletions(&last, &desired);
    if let Some(Json::Object(delta)) = delta(&last, live, &desired, &mut Vec::new(), kind) {
        deep_merge(&mut out, delta);
    }
    non_empty(out)
}

fn without_annotation(desired: &Json) -> Json {
    let mut out = desired.clone();
    let emptied = match out.get_mut("metadata").and_then(|m| m.get_mut("annotations")).and_then(|a| a.as_object_mut()) {
        Some(a) => {
            a.remove(LAST_APPLIED_ANNOTATION);
            a.is_empty()
        }
        None => false,
    };
    if emptied {
        if let Some(meta) = out.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("annotations");
        }
    }
    out
}

// Fields present in the last-applied definition but gone from the desired one.
fn deletions(last: &Json, desired: &Json) -> Map<String, Json> {
    let mut out = Map::new();
    let Some(l) = last.as_object() else { return out };
    let d = desired.as_object();
    for (k, lv) in l {
        match (lv, d.and_then(|d| d.get(k))) {
            (_, None) => {
                out.insert(k.clone(), Json::Null);
            }
            (Json::Object(_), Some(dv @ Json::Object(_))) => {
                let nested = deletions(lv, dv);
                if !nested.is_empty() {
                    out.insert(k.clone(), Json::Object(nested));
                }
            }
            _ => {}
        }
    }
    out
}

// Desired fields whose live value differs, merging keyed lists against what was last applied.
fn delta<'a>(last: &Json, live: &Json, desired: &'a Json, path: &mut Vec<&'a str>, kind: &str) -> Option<Json> {
    let (Json::Object(d), Json::Object(l)) = (desired, live) else {
        return (!json_eq(desired, live)).then(|| without_nulls(desired));
    };
    let mut out = Map::new();
    for (k, dv) in d {
        path.push(k.as_str());
        let last_v = last.get(k).unwrap_or(&EMPTY);
        let change = match (dv, l.get(k)) {
            (Json::Null, None | Some(Json::Null)) => None,
            (Json::Null, Some(_)) => Some(Json::Null),
            (dv, None | Some(Json::Null)) => Some(without_nulls(dv)).filter(|v| !is_empty_container(v)),
            (Json::Object(_), Some(lv @ Json::Object(_))) => delta(last_v, lv, dv, path, kind),
            (Json::Array(da), Some(Json::Array(la))) => {
                let last_list = last_v.as_array().map(Vec::as_slice).unwrap_or(&[]);
                list_delta(last_list, la, da, path, kind)
            }
            (dv, Some(lv)) => (!json_eq(dv, lv)).then(|| without_nulls(dv)),
        };
        path.pop();
        if let Some(v) = change {
            out.insert(k.clone(), v);
        }
    }
    non_empty(out)
}

// Full replacement list for a changed list. Keyed lists keep elements other
// actors added (never in last-applied) and drop ones removed since last apply.
fn list_delta<'a>(last: &[Json], live: &[Json], desired: &'a [Json], path: &mut Vec<&'a str>, kind: &str) -> Option<Json> {
    let key = merge_key(kind, path).filter(|k| all_keyed(desired, k) && all_keyed(live, k));
    let Some(key) = key else {
        return (!lists_match(desired, live)).then(|| Json::Array(desired.iter().map(without_nulls).collect()));
    };
    let mut merged = Vec::with_capacity(live.len().max(desired.len()));
    for le in live {
        let id = &le[key];
        match find_by(desired, key, id) {
            Some(de) => {
                let last_e = find_by(last, key, id).unwrap_or(&EMPTY);
                let mut element = le.clone();
                let mut p = deletions(last_e, de);
                if let Some(Json::Object(d)) = delta(last_e, le, de, path, kind) {
                    deep_merge(&mut p, d);
                }
                json_patch::merge(&mut element, &Json::Object(p));
                merged.push(element);
            }
            None if find_by(last, key, id).is_none() => merged.push(le.clone()),
            None => {}
        }
    }
    for de in desired {
        if find_by(live, key, &de[key]).is_none() {
            merged.push(without_nulls(de));
        }
    }
    let unchanged = merged.len() == live.len() && merged.iter().zip(live).all(|(m, l)| json_eq(m, l));
    (!unchanged).then_some(Json::Array(merged))
}

fn find_by<'x>(items: &'x [Json], key: &str, id: &Json) -> Option<&'x Json> {
    items.iter().find(|e| e.get(key).map_or(false, |v| json_eq(v, id)))
}

// Recursive merge of `src` into `dst`; `src` wins on conflicts.
fn deep_merge(dst: &mut Map<String, Json>, src: Map<String, Json>) {
    for (k, v) in src {
        match v {
            Json::Object(s) if dst.get(&k).map_or(false, Json::is_object) => {
                if let Some(Json::Object(d)) = dst.get_mut(&k) {
                    deep_merge(d, s);
                }
            }
            v => {
                dst.insert(k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(desired: &Json) -> Json {
        // Live object right after `desired` was applied, plus server fields.
        let mut live = annotate(desired);
        live["metadata"]["uid"] = json!("u1");
        live["metadata"]["resourceVersion"] = json!("1");
        live
    }

    fn config(data: Json) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "ns"}, "data": data})
    }

    #[test]
    fn reapplying_same_definition_is_a_noop() {
        let desired = config(json!({"a": "1"}));
        assert_eq!(apply_patch(&desired, &applied(&desired)), None);
    }

    #[test]
    fn annotation_is_canonical_and_self_excluding() {
        let out = annotate(&config(json!({"b": "2", "a": "1"})));
        let record = object::annotation(&out, LAST_APPLIED_ANNOTATION).unwrap();
        assert!(record.starts_with(r#"{"apiVersion":"v1","data":{"a":"1","b":"2"}"#), "record={}", record);
        assert!(!record.contains("last-applied"));
        assert_eq!(annotate(&out), out);
    }

    #[test]
    fn status_is_left_out_of_the_record() {
        let mut desired = config(json!({"a": "1"}));
        desired["status"] = json!({"x": 1});
        let live = applied(&desired);
        let record = object::annotation(&live, LAST_APPLIED_ANNOTATION).unwrap();
        assert!(!record.contains("status"), "record={}", record);
        assert_eq!(apply_patch(&desired, &live), None);
    }

    #[test]
    fn fields_dropped_since_last_apply_are_removed() {
        let before = config(json!({"a": "1", "b": "2"}));
        let mut live = applied(&before);
        // another actor adds a key we never managed
        live["data"]["c"] = json!("3");
        let after = config(json!({"a": "1"}));
        let patch = apply_patch(&after, &live).unwrap();
        assert_eq!(patch["data"], json!({"b": null}));
        assert!(patch["metadata"]["annotations"][LAST_APPLIED_ANNOTATION].is_string());

        let mut next = live.clone();
        json_patch::merge(&mut next, &patch);
        assert_eq!(next["data"], json!({"a": "1", "c": "3"}));
        assert_eq!(apply_patch(&after, &next), None);
    }

    #[test]
    fn missing_annotation_falls_back_to_two_way_and_records_it() {
        let desired = config(json!({"a": "1"}));
        let live = config(json!({"a": "1"}));
        let patch = apply_patch(&desired, &live).unwrap();
        assert_eq!(patch.as_object().unwrap().len(), 1);
        assert!(patch["metadata"]["annotations"][LAST_APPLIED_ANNOTATION].is_string());
    }

    #[test]
    fn keyed_lists_keep_foreign_elements_and_order() {
        let dep = |image: &str| {
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "ns"},
                "spec": {"template": {"spec": {"containers": [{"name": "app", "image": image}]}}}})
        };
        let mut live = applied(&dep("app:1"));
        // an injected sidecar that was never part of the definition
        live["spec"]["template"]["spec"]["containers"] = json!([
            {"name": "app", "image": "app:1", "imagePullPolicy": "Always"},
            {"name": "mesh-proxy", "image": "proxy:1"}
        ]);
        assert_eq!(apply_patch(&dep("app:1"), &live), None);

        let patch = apply_patch(&dep("app:2"), &live).unwrap();
        let containers = patch["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0], json!({"name": "app", "image": "app:2", "imagePullPolicy": "Always"}));
        assert_eq!(containers[1]["name"], "mesh-proxy");
    }

    #[test]
    fn keyed_elements_removed_since_last_apply_are_dropped() {
        let svc = |ports: Json| json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web"}, "spec": {"ports": ports}});
        let live = applied(&svc(json!([{"port": 80}, {"port": 443}])));
        let patch = apply_patch(&svc(json!([{"port": 80}])), &live).unwrap();
        assert_eq!(patch["spec"]["ports"], json!([{"port": 80}]));
    }
}
