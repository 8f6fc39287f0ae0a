//! Content-hashed names for immutable config objects.
//!
//! Any change to the hashed fields yields a new name, so workloads referencing
//! the object roll over to new content instead of seeing it mutate in place.

use rekon_core::{object, ReconcileError};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::canonical_json;

const SUFFIX_LEN: usize = 10;

/// Hash suffix over the given dotted field paths of `def`.
///
/// Fields are hashed in canonical form, so key order in the definition does not matter.
pub fn content_hash(def: &Json, fields: &[&str]) -> String {
    let mut content = Map::new();
    for field in fields {
        if let Some(v) = lookup(def, field) {
            content.insert((*field).to_string(), v.clone());
        }
    }
    let digest = Sha256::digest(canonical_json(&Json::Object(content)).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    encode_suffix(&hex[..SUFFIX_LEN])
}

/// Set `metadata.name` to `<name>-<hash>` and return the new name.
///
/// Without a name the lowercased kind is the base.
pub fn append_hash(def: &mut Json, fields: &[&str]) -> Result<String, ReconcileError> {
    let suffix = content_hash(def, fields);
    let base = match object::name(def) {
        Some(n) => n.to_string(),
        None => object::kind(def).unwrap_or("object").to_ascii_lowercase(),
    };
    let name = format!("{}-{}", base, suffix);
    let meta = object::metadata_mut(def).ok_or_else(|| ReconcileError::Definition("metadata must be an object".into()))?;
    meta.insert("name".into(), Json::String(name.clone()));
    Ok(name)
}

// Swap characters that could turn the suffix into a word, as kubectl does.
fn encode_suffix(hex: &str) -> String {
    hex.chars()
        .map(|c| match c {
            '0' => 'g',
            '1' => 'h',
            '3' => 'k',
            'a' => 'm',
            'e' => 't',
            c => c,
        })
        .collect()
}

fn lookup<'a>(v: &'a Json, dotted: &str) -> Option<&'a Json> {
    dotted.split('.').try_fold(v, |cur, seg| cur.get(seg)).filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FIELDS: &[&str] = &["data", "binaryData", "metadata.labels"];

    #[test]
    fn known_vector() {
        let def = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}, "data": {"key": "value"}});
        assert_eq!(content_hash(&def, FIELDS), "6dgk299fbb");
    }

    #[test]
    fn hash_ignores_key_order_and_unhashed_fields() {
        let a: Json = serde_json::from_str(r#"{"kind": "ConfigMap", "metadata": {"name": "cfg"}, "data": {"x": "1", "y": "2"}}"#).unwrap();
        let b: Json = serde_json::from_str(r#"{"data": {"y": "2", "x": "1"}, "metadata": {"name": "other", "annotations": {"n": "1"}}, "kind": "ConfigMap"}"#).unwrap();
        assert_eq!(content_hash(&a, FIELDS), content_hash(&b, FIELDS));
    }

    #[test]
    fn hash_changes_with_content_and_labels() {
        let base = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}, "data": {"x": "1"}});
        let data = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}, "data": {"x": "2"}});
        let labels = json!({"kind": "ConfigMap", "metadata": {"name": "cfg", "labels": {"app": "a"}}, "data": {"x": "1"}});
        let h = content_hash(&base, FIELDS);
        assert_ne!(h, content_hash(&data, FIELDS));
        assert_ne!(h, content_hash(&labels, FIELDS));
        assert_eq!(h.len(), 10);
        assert!(h.chars().all(|c| !"013ae".contains(c)));
    }

    #[test]
    fn append_hash_rewrites_name() {
        let mut def = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}, "data": {"key": "value"}});
        assert_eq!(append_hash(&mut def, FIELDS).unwrap(), "cfg-6dgk299fbb");
        assert_eq!(def["metadata"]["name"], "cfg-6dgk299fbb");

        let mut unnamed = json!({"kind": "ConfigMap", "data": {"key": "value"}});
        assert_eq!(append_hash(&mut unnamed, FIELDS).unwrap(), "configmap-6dgk299fbb");
    }
}
