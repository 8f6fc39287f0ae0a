//! Minimal patches between a desired definition and the live object.
//!
//! Only fields the definition mentions are compared, so values the server
//! defaults or owns never register as drift. An explicit `null` in the
//! definition asks for removal; a field the definition leaves out is left alone.

use rekon_core::{object, MergeStrategy};
use serde_json::{Map, Value as Json};
use tracing::trace;

use crate::keys::merge_key;

/// Patch body for `strategy`, or `None` when the live object already matches.
///
/// For [`MergeStrategy::Json`] the body is an array of RFC 6902 operations.
pub fn compute_patch(desired: &Json, live: &Json, strategy: MergeStrategy) -> Option<Json> {
    let kind = object::kind(desired).unwrap_or_default();
    let desired = managed(desired);
    let patch = match strategy {
        MergeStrategy::Merge => merge_delta(&desired, live, &mut Vec::new(), kind, false),
        MergeStrategy::StrategicMerge => merge_delta(&desired, live, &mut Vec::new(), kind, true),
        MergeStrategy::Json => {
            let target = overlay(live, &desired);
            let ops = json_patch::diff(live, &target);
            if ops.0.is_empty() {
                None
            } else {
                serde_json::to_value(ops).ok()
            }
        }
    };
    trace!(kind, strategy = %strategy, changed = patch.is_some(), "computed patch");
    patch
}

/// The live object as it would look with the definition laid over it.
pub fn overlay(live: &Json, desired: &Json) -> Json {
    match (live, desired) {
        (Json::Object(l), Json::Object(d)) => {
            let mut out = l.clone();
            for (k, dv) in d {
                if dv.is_null() {
                    out.remove(k);
                    continue;
                }
                let next = match l.get(k) {
                    Some(lv) if !lv.is_null() => overlay(lv, dv),
                    _ => {
                        let v = without_nulls(dv);
                        if is_empty_container(&v) {
                            continue;
                        }
                        v
                    }
                };
                out.insert(k.clone(), next);
            }
            Json::Object(out)
        }
        (Json::Array(l), Json::Array(d)) if l.len() == d.len() => {
            Json::Array(l.iter().zip(d).map(|(lv, dv)| overlay(lv, dv)).collect())
        }
        (lv, dv) if json_eq(lv, dv) => lv.clone(),
        (_, dv) => without_nulls(dv),
    }
}

/// Definition fields reconciliation manages: everything but top-level `status`.
pub(crate) fn managed(desired: &Json) -> Json {
    let mut out = desired.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.remove("status");
    }
    out
}

pub(crate) fn merge_delta<'a>(desired: &'a Json, live: &Json, path: &mut Vec<&'a str>, kind: &str, keyed: bool) -> Option<Json> {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => {
            let mut out = Map::new();
            for (k, dv) in d {
                path.push(k.as_str());
                let delta = field_delta(dv, l.get(k), path, kind, keyed);
                path.pop();
                if let Some(v) = delta {
                    out.insert(k.clone(), v);
                }
            }
            non_empty(out)
        }
        (Json::Array(d), Json::Array(l)) => list_delta(d, l, path, kind, keyed),
        (dv, lv) if json_eq(dv, lv) => None,
        (dv, _) => Some(without_nulls(dv)),
    }
}

fn field_delta<'a>(dv: &'a Json, lv: Option<&Json>, path: &mut Vec<&'a str>, kind: &str, keyed: bool) -> Option<Json> {
    match (dv, lv) {
        (Json::Null, None | Some(Json::Null)) => None,
        (Json::Null, Some(_)) => Some(Json::Null),
        (dv, None | Some(Json::Null)) => {
            let v = without_nulls(dv);
            (!is_empty_container(&v)).then_some(v)
        }
        (dv, Some(lv)) => merge_delta(dv, lv, path, kind, keyed),
    }
}

fn list_delta<'a>(d: &'a [Json], l: &[Json], path: &mut Vec<&'a str>, kind: &str, keyed: bool) -> Option<Json> {
    if keyed {
        if let Some(key) = merge_key(kind, path).filter(|k| all_keyed(d, k)) {
            let mut out = Vec::new();
            for de in d {
                let id = &de[key];
                match l.iter().find(|le| le.get(key).map_or(false, |v| json_eq(v, id))) {
                    None => out.push(without_nulls(de)),
                    Some(le) => {
                        if let Some(mut p) = merge_delta(de, le, path, kind, keyed) {
                            if let Some(m) = p.as_object_mut() {
                                m.insert(key.to_string(), id.clone());
                            }
                            out.push(p);
                        }
                    }
                }
            }
            return (!out.is_empty()).then_some(Json::Array(out));
        }
    }
    if lists_match(d, l) {
        None
    } else {
        Some(Json::Array(d.iter().map(without_nulls).collect()))
    }
}

pub(crate) fn all_keyed(items: &[Json], key: &str) -> bool {
    items.iter().all(|e| e.get(key).map_or(false, |v| !v.is_null()))
}

/// Same length, and each desired element is satisfied by the live one at its index.
pub(crate) fn lists_match(desired: &[Json], live: &[Json]) -> bool {
    desired.len() == live.len() && desired.iter().zip(live).all(|(d, l)| contained(d, l))
}

/// Every field `desired` mentions has the same value in `live`.
pub(crate) fn contained(desired: &Json, live: &Json) -> bool {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => d.iter().all(|(k, dv)| match (dv, l.get(k)) {
            (Json::Null, lv) => lv.map_or(true, Json::is_null),
            (dv, None) => is_empty_container(&without_nulls(dv)),
            (dv, Some(lv)) => contained(dv, lv),
        }),
        (Json::Array(d), Json::Array(l)) => lists_match(d, l),
        (d, l) => json_eq(d, l),
    }
}

/// Structural equality that treats `1` and `1.0` as the same number.
pub fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x == y || x.as_f64() == y.as_f64(),
        (Json::Object(x), Json::Object(y)) => x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |w| json_eq(v, w))),
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(v, w)| json_eq(v, w)),
        (a, b) => a == b,
    }
}

/// Copy of `v` with `null` object members removed at every depth.
pub(crate) fn without_nulls(v: &Json) -> Json {
    match v {
        Json::Object(m) => Json::Object(m.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), without_nulls(v))).collect()),
        Json::Array(items) => Json::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

pub(crate) fn is_empty_container(v: &Json) -> bool {
    match v {
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}

pub(crate) fn non_empty(m: Map<String, Json>) -> Option<Json> {
    (!m.is_empty()).then_some(Json::Object(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live_deployment() -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns", "resourceVersion": "7", "uid": "u1"},
            "spec": {
                "replicas": 2,
                "progressDeadlineSeconds": 600,
                "template": {"spec": {
                    "containers": [
                        {"name": "app", "image": "app:1", "imagePullPolicy": "IfNotPresent",
                         "ports": [{"containerPort": 80, "protocol": "TCP"}]},
                        {"name": "sidecar", "image": "side:1"}
                    ],
                    "restartPolicy": "Always"
                }}
            },
            "status": {"readyReplicas": 2}
        })
    }

    fn desired_deployment() -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns"},
            "spec": {
                "replicas": 2,
                "template": {"spec": {"containers": [
                    {"name": "app", "image": "app:1", "ports": [{"containerPort": 80}]},
                    {"name": "sidecar", "image": "side:1"}
                ]}}
            }
        })
    }

    #[test]
    fn server_defaults_are_not_drift() {
        for strategy in [MergeStrategy::Merge, MergeStrategy::StrategicMerge, MergeStrategy::Json] {
            assert_eq!(compute_patch(&desired_deployment(), &live_deployment(), strategy), None, "strategy={}", strategy);
        }
    }

    #[test]
    fn strategic_merge_sends_only_changed_keyed_elements() {
        let mut desired = desired_deployment();
        desired["spec"]["template"]["spec"]["containers"][1]["image"] = json!("side:2");
        let patch = compute_patch(&desired, &live_deployment(), MergeStrategy::StrategicMerge).unwrap();
        assert_eq!(patch, json!({"spec": {"template": {"spec": {"containers": [{"name": "sidecar", "image": "side:2"}]}}}}));
    }

    #[test]
    fn merge_replaces_whole_list_on_change() {
        let mut desired = desired_deployment();
        desired["spec"]["template"]["spec"]["containers"][1]["image"] = json!("side:2");
        let patch = compute_patch(&desired, &live_deployment(), MergeStrategy::Merge).unwrap();
        let containers = patch["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1]["image"], "side:2");
        assert!(patch["spec"].get("replicas").is_none());
    }

    #[test]
    fn explicit_null_differs_from_missing() {
        let live = json!({"kind": "ConfigMap", "metadata": {"name": "c", "labels": {"team": "a", "tier": "web"}}, "data": {"a": "1"}});

        let desired = json!({"kind": "ConfigMap", "metadata": {"name": "c", "labels": {"tier": null}}, "data": {"a": "1"}});
        let patch = compute_patch(&desired, &live, MergeStrategy::Merge).unwrap();
        assert_eq!(patch, json!({"metadata": {"labels": {"tier": null}}}));

        let desired = json!({"kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"a": "1"}});
        assert_eq!(compute_patch(&desired, &live, MergeStrategy::Merge), None);

        // null for a field the live object lacks asks for nothing
        let desired = json!({"kind": "ConfigMap", "metadata": {"name": "c", "annotations": null}, "data": {"a": "1"}});
        assert_eq!(compute_patch(&desired, &live, MergeStrategy::Merge), None);
    }

    #[test]
    fn json_strategy_emits_operations() {
        let live = json!({"kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"a": "1", "b": "2"}});
        let desired = json!({"kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"a": "9", "b": null}});
        let patch = compute_patch(&desired, &live, MergeStrategy::Json).unwrap();
        let ops = patch.as_array().unwrap();
        assert_eq!(ops.len(), 2);
        let mut applied = live.clone();
        let parsed: json_patch::Patch = serde_json::from_value(patch).unwrap();
        json_patch::patch(&mut applied, &parsed).unwrap();
        assert_eq!(applied["data"], json!({"a": "9"}));
    }

    #[test]
    fn desired_status_is_ignored() {
        let mut desired = desired_deployment();
        desired["status"] = json!({"readyReplicas": 5});
        assert_eq!(compute_patch(&desired, &live_deployment(), MergeStrategy::Merge), None);
    }

    #[test]
    fn numbers_compare_by_value() {
        let live = json!({"kind": "Widget", "spec": {"ratio": 1}});
        let desired = json!({"kind": "Widget", "spec": {"ratio": 1.0}});
        assert_eq!(compute_patch(&desired, &live, MergeStrategy::Merge), None);
        assert!(json_eq(&json!([1, {"a": 2.0}]), &json!([1.0, {"a": 2}])));
    }

    #[test]
    fn overlay_keeps_unmentioned_fields() {
        let out = overlay(&live_deployment(), &json!({"spec": {"replicas": 3, "paused": null}}));
        assert_eq!(out["spec"]["replicas"], 3);
        assert_eq!(out["spec"]["progressDeadlineSeconds"], 600);
        assert_eq!(out["metadata"]["uid"], "u1");
    }
}
