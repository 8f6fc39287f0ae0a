//! Merge keys for lists of objects in built-in kinds.
//!
//! A list whose elements are identified by a key (containers by `name`, ports
//! by `containerPort`, ...) is merged element by element under strategic merge
//! and three-way apply. Paths omit list indices: `containers.env` names the
//! `env` list inside every container.

use std::collections::HashMap;

use once_cell::sync::Lazy;

// Relative to a pod spec.
const POD_SPEC_KEYS: &[(&str, &str)] = &[
    ("volumes", "name"),
    ("imagePullSecrets", "name"),
    ("hostAliases", "ip"),
    ("topologySpreadConstraints", "topologyKey"),
    ("resourceClaims", "name"),
];

// Relative to each container list of a pod spec.
const CONTAINER_KEYS: &[(&str, &str)] = &[
    ("", "name"),
    ("env", "name"),
    ("ports", "containerPort"),
    ("volumeMounts", "mountPath"),
    ("volumeDevices", "devicePath"),
];

const CONTAINER_LISTS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

// Where each workload kind keeps its pod spec.
const POD_SPEC_PATHS: &[(&str, &str)] = &[
    ("Pod", "spec"),
    ("PodTemplate", "template.spec"),
    ("ReplicationController", "spec.template.spec"),
    ("ReplicaSet", "spec.template.spec"),
    ("Deployment", "spec.template.spec"),
    ("DaemonSet", "spec.template.spec"),
    ("StatefulSet", "spec.template.spec"),
    ("Job", "spec.template.spec"),
    ("CronJob", "spec.jobTemplate.spec.template.spec"),
];

const OTHER_KEYS: &[(&str, &str, &str)] = &[
    ("Service", "spec.ports", "port"),
    ("ServiceAccount", "secrets", "name"),
    ("ServiceAccount", "imagePullSecrets", "name"),
    ("MutatingWebhookConfiguration", "webhooks", "name"),
    ("ValidatingWebhookConfiguration", "webhooks", "name"),
];

static MERGE_KEYS: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for (kind, base) in POD_SPEC_PATHS {
        for (rel, key) in POD_SPEC_KEYS {
            table.insert(format!("{}.{}.{}", kind, base, rel), *key);
        }
        for list in CONTAINER_LISTS {
            for (rel, key) in CONTAINER_KEYS {
                let path = if rel.is_empty() { format!("{}.{}.{}", kind, base, list) } else { format!("{}.{}.{}.{}", kind, base, list, rel) };
                table.insert(path, *key);
            }
        }
    }
    for (kind, path, key) in OTHER_KEYS {
        table.insert(format!("{}.{}", kind, path), *key);
    }
    table
});

/// Merge key of the list at `path` in a `kind` object, if it is a keyed list.
pub fn merge_key(kind: &str, path: &[&str]) -> Option<&'static str> {
    if kind.is_empty() || path.is_empty() {
        return None;
    }
    MERGE_KEYS.get(&format!("{}.{}", kind, path.join("."))).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_lists_resolve_through_pod_template() {
        assert_eq!(merge_key("Deployment", &["spec", "template", "spec", "containers"]), Some("name"));
        assert_eq!(merge_key("Deployment", &["spec", "template", "spec", "containers", "ports"]), Some("containerPort"));
        assert_eq!(merge_key("Pod", &["spec", "initContainers", "volumeMounts"]), Some("mountPath"));
        assert_eq!(merge_key("CronJob", &["spec", "jobTemplate", "spec", "template", "spec", "volumes"]), Some("name"));
        assert_eq!(merge_key("Service", &["spec", "ports"]), Some("port"));
    }

    #[test]
    fn unknown_paths_have_no_key() {
        assert_eq!(merge_key("Deployment", &["spec", "containers"]), None);
        assert_eq!(merge_key("Widget", &["spec", "items"]), None);
        assert_eq!(merge_key("", &["spec"]), None);
    }
}
