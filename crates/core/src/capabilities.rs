//! Per-kind special behaviour, looked up once per reconciliation.
//!
//! A kind may need a provisioning request instead of a direct create, may have
//! a built-in readiness predicate for waits, and may be content-hashed into its
//! name. Kinds without an entry get none of these.

use std::collections::HashMap;

/// Built-in readiness predicates (evaluated by the wait coordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Deployment,
    DaemonSet,
    StatefulSet,
    Pod,
}

/// Creation must go through a companion request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provisioning {
    pub request_kind: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCapabilities {
    pub provisioning: Option<Provisioning>,
    pub readiness: Option<Readiness>,
    /// Dotted paths hashed into the name suffix; `Some` marks the kind hashable.
    pub hash_fields: Option<&'static [&'static str]>,
}

const CONFIGMAP_HASH_FIELDS: &[&str] = &["data", "binaryData", "metadata.labels"];
const SECRET_HASH_FIELDS: &[&str] = &["data", "stringData", "type", "metadata.labels"];

#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: HashMap<&'static str, KindCapabilities>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        let project = KindCapabilities {
            provisioning: Some(Provisioning { request_kind: "ProjectRequest" }),
            ..Default::default()
        };
        let ready = |r| KindCapabilities { readiness: Some(r), ..Default::default() };
        let hashed = |f| KindCapabilities { hash_fields: Some(f), ..Default::default() };
        Self::empty()
            .with_entry("Project", project)
            .with_entry("ProjectRequest", project)
            .with_entry("Deployment", ready(Readiness::Deployment))
            .with_entry("DaemonSet", ready(Readiness::DaemonSet))
            .with_entry("StatefulSet", ready(Readiness::StatefulSet))
            .with_entry("Pod", ready(Readiness::Pod))
            .with_entry("ConfigMap", hashed(CONFIGMAP_HASH_FIELDS))
            .with_entry("Secret", hashed(SECRET_HASH_FIELDS))
    }
}

impl CapabilityTable {
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn with_entry(mut self, kind: &'static str, caps: KindCapabilities) -> Self {
        self.entries.insert(kind, caps);
        self
    }

    pub fn lookup(&self, kind: &str) -> KindCapabilities {
        self.entries.get(kind).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_special_kinds() {
        let t = CapabilityTable::default();
        assert_eq!(t.lookup("Project").provisioning.map(|p| p.request_kind), Some("ProjectRequest"));
        assert_eq!(t.lookup("Deployment").readiness, Some(Readiness::Deployment));
        assert!(t.lookup("ConfigMap").hash_fields.is_some());
        assert_eq!(t.lookup("Service"), KindCapabilities::default());
    }
}
