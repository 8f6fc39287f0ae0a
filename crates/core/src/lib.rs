//! Rekon core types: desired state, patch strategies, wait specs and results.
//!
//! Everything here is transport-agnostic. The cluster itself is reached through
//! the [`ClusterClient`] seam so the reconciliation logic can run against the
//! kube-backed client or the in-memory [`fake::FakeCluster`].

#![forbid(unsafe_code)]

pub mod capabilities;
pub mod client;
pub mod error;
pub mod fake;
pub mod object;
pub mod options;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

pub use client::{ClusterClient, Validator, ValidationIssue};
pub use error::{ApiStatus, ClientError, ReconcileError, ReconcileFailure};
pub use object::ObjectRef;
pub use options::{ReconcileOptions, ValidateOptions};

/// Target state for one reconciliation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

impl FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            other => Err(format!("invalid state: {} (expect present|absent)", other)),
        }
    }
}

/// Patch semantics understood by the API server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// RFC 6902 operations.
    Json,
    /// RFC 7386 merge patch.
    Merge,
    /// Kubernetes strategic merge patch (lists merged by key).
    StrategicMerge,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Merge => "merge",
            Self::StrategicMerge => "strategic-merge",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json-patch+json",
            Self::Merge => "application/merge-patch+json",
            Self::StrategicMerge => "application/strategic-merge-patch+json",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "merge" => Ok(Self::Merge),
            "strategic-merge" => Ok(Self::StrategicMerge),
            other => Err(format!("invalid merge type: {} (expect json|merge|strategic-merge)", other)),
        }
    }
}

/// Value of a status condition's `status` field.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    #[default]
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl FromStr for ConditionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" | "true" => Ok(Self::True),
            "False" | "false" => Ok(Self::False),
            "Unknown" | "unknown" => Ok(Self::Unknown),
            other => Err(format!("invalid condition status: {} (expect True|False|Unknown)", other)),
        }
    }
}

// YAML users write `status: True`, which arrives as a boolean.
impl<'de> Deserialize<'de> for ConditionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bool(true) => Ok(Self::True),
            Raw::Bool(false) => Ok(Self::False),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A status condition to wait for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitCondition {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// How (and whether) to block until the cluster reports convergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    pub enabled: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub condition: Option<WaitCondition>,
}

impl Default for WaitSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            condition: None,
        }
    }
}

impl WaitSpec {
    /// Effective condition: ignored unless waiting is enabled and a type is given.
    pub fn condition(&self) -> Option<&WaitCondition> {
        if !self.enabled {
            return None;
        }
        self.condition.as_ref().filter(|c| !c.type_.is_empty())
    }
}

/// Action taken (or that would be taken in check mode).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Create,
    Patch,
    Delete,
    Provision,
    Noop,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Provision => "provision",
            Self::Noop => "noop",
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Self::Noop)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Humanized count of field-level differences between two objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Outcome of one successful reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileResult {
    pub changed: bool,
    pub method: Method,
    /// Resulting live object; empty object after a deletion.
    pub result: Json,
    /// Seconds spent waiting, present only when a wait ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ReconcileResult {
    pub fn noop(live: Json) -> Self {
        Self { changed: false, method: Method::Noop, result: live, duration: None, diff: None, warnings: Vec::new() }
    }
}

pub mod prelude {
    pub use super::{
        ClusterClient, ConditionStatus, DesiredState, DiffSummary, MergeStrategy, Method, ObjectRef,
        ReconcileResult, WaitCondition, WaitSpec,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_status_accepts_yaml_booleans_and_strings() {
        let c: WaitCondition = serde_json::from_value(serde_json::json!({"type": "Ready", "status": true})).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        let c: WaitCondition = serde_json::from_value(serde_json::json!({"type": "Ready", "status": "Unknown"})).unwrap();
        assert_eq!(c.status, ConditionStatus::Unknown);
        let c: WaitCondition = serde_json::from_value(serde_json::json!({"type": "Ready"})).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        assert!(serde_json::from_value::<WaitCondition>(serde_json::json!({"type": "Ready", "status": "maybe"})).is_err());
    }

    #[test]
    fn wait_condition_ignored_without_type_or_when_disabled() {
        let mut spec = WaitSpec { enabled: true, condition: Some(WaitCondition::default()), ..Default::default() };
        assert!(spec.condition().is_none());
        spec.condition = Some(WaitCondition { type_: "Available".into(), ..Default::default() });
        assert!(spec.condition().is_some());
        spec.enabled = false;
        assert!(spec.condition().is_none());
    }

    #[test]
    fn merge_strategy_round_trips_through_strings() {
        for s in ["json", "merge", "strategic-merge"] {
            let m: MergeStrategy = s.parse().unwrap();
            assert_eq!(m.as_str(), s);
        }
        assert!("replace".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::StrategicMerge.content_type(), "application/strategic-merge-patch+json");
    }
}
