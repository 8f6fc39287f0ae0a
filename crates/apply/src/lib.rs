//! Rekon apply: strategy selection, minimal patches, three-way apply and content-hashed names.
//!
//! Everything in this crate is pure computation over JSON. Cluster calls live
//! in the reconciler; this crate only decides what to send.

#![forbid(unsafe_code)]

pub mod hash;
pub mod keys;
pub mod patch;
pub mod strategy;
pub mod threeway;

use serde_json::Value as Json;

pub use hash::{append_hash, content_hash};
pub use patch::{compute_patch, overlay};
pub use rekon_core::DiffSummary;
pub use strategy::{select_strategies, StrategyPlan};
pub use threeway::{annotate, apply_patch, LAST_APPLIED_ANNOTATION};

/// Drop server-maintained fields that should never count as a difference.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count field-level adds, updates and removes going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| !patch::json_eq(x, y)).count();
                if aa.len() > bb.len() {
                    s.adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    s.removes += bb.len() - aa.len();
                }
            }
            (av, bv) => {
                if !patch::json_eq(av, bv) {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Deterministic JSON text: object keys sorted at every level, no whitespace.
pub fn canonical_json(v: &Json) -> String {
    fn write(v: &Json, out: &mut String) {
        match v {
            Json::Object(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Json::String(k.clone()).to_string());
                    out.push(':');
                    write(&m[k], out);
                }
                out.push('}');
            }
            Json::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }
    let mut out = String::new();
    write(v, &mut out);
    out
}
