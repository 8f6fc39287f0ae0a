//! Reading definitions and params files.

use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rekon_core::ReconcileOptions;
use serde::Deserialize;
use serde_json::Value as Json;

fn max_yaml_bytes() -> usize {
    std::env::var("REKON_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("REKON_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_count_exceeds(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, seen: &mut usize, max: usize) {
        *seen += 1;
        let children: Vec<&Json> = match v {
            Json::Object(map) => map.values().collect(),
            Json::Array(items) => items.iter().collect(),
            _ => return,
        };
        for c in children {
            if *seen >= max {
                return;
            }
            walk(c, seen, max);
        }
    }
    let mut seen = 0usize;
    walk(v, &mut seen, max);
    seen >= max
}

fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Parse one or more `---` separated YAML documents. Empty documents are skipped.
pub fn parse_documents(text: &str) -> Result<Vec<Json>> {
    if text.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if node_count_exceeds(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document {} too complex (>{} nodes)", i + 1, max_yaml_nodes()));
        }
        out.push(json);
    }
    Ok(out)
}

/// Every document from every source, in order.
pub fn load_definitions(paths: &[impl AsRef<Path>]) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for p in paths {
        out.extend(parse_documents(&read_source(p.as_ref())?)?);
    }
    Ok(out)
}

/// Options from a params file (YAML or JSON, keys as in [`ReconcileOptions`]).
pub fn load_params(path: &Path) -> Result<ReconcileOptions> {
    let text = read_source(path)?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing params file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::{DesiredState, MergeStrategy};
    use serde_json::json;

    #[test]
    fn multi_document_yaml() {
        let text = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n";
        let docs = parse_documents(text).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "Secret");
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(parse_documents("kind: a\n---\nkind: [unclosed\n").is_err());
    }

    #[test]
    fn node_budget() {
        assert!(!node_count_exceeds(&json!({"a": [1, 2]}), 5));
        assert!(node_count_exceeds(&json!({"a": [1, 2, 3, 4, 5]}), 5));
    }

    #[test]
    fn params_file_uses_option_names() {
        let dir = std::env::temp_dir().join(format!("rekon-params-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params.yaml");
        std::fs::write(
            &path,
            "state: absent\nmerge_type: [merge, json]\nwait: true\nwait_condition:\n  type: Ready\n  status: True\n",
        )
        .unwrap();
        let opts = load_params(&path).unwrap();
        assert_eq!(opts.state, DesiredState::Absent);
        assert_eq!(opts.merge_type, vec![MergeStrategy::Merge, MergeStrategy::Json]);
        assert_eq!(opts.wait_sleep, 5);
        assert_eq!(opts.wait_condition.unwrap().type_, "Ready");
        std::fs::remove_dir_all(&dir).ok();
    }
}
