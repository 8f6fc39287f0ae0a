//! Error taxonomy shared by all rekon crates.
//!
//! [`ClientError`] is the closed set of outcomes a [`crate::ClusterClient`] call can
//! fail with; callers branch on it with an explicit `match`. [`ReconcileError`]
//! is what a reconciliation run fails with, and [`ReconcileFailure`] adds the
//! side effects that were already committed when it failed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::{MergeStrategy, Method, ValidationIssue};

/// Status block returned by the API server with a failed request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl ApiStatus {
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), message: message.into() }
    }
}

/// Outcome variants of a failed cluster call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found: {}", .0.message)]
    NotFound(ApiStatus),
    #[error("forbidden: {}", .0.message)]
    Forbidden(ApiStatus),
    /// The server does not accept this patch content type for the resource.
    #[error("{strategy} patch not supported: {}", status.message)]
    UnsupportedStrategy { strategy: MergeStrategy, status: ApiStatus },
    #[error("api error ({}): {}", .0.code, .0.message)]
    Api(ApiStatus),
    #[error("resource discovery failed: {0}")]
    Discovery(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ApiStatus::new(404, "NotFound", message))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(ApiStatus::new(403, "Forbidden", message))
    }

    pub fn unsupported(strategy: MergeStrategy) -> Self {
        Self::UnsupportedStrategy {
            strategy,
            status: ApiStatus::new(
                415,
                "UnsupportedMediaType",
                format!("the body of the request was in an unknown format - accepted media types include: {}", strategy.content_type()),
            ),
        }
    }

    pub fn status(&self) -> Option<&ApiStatus> {
        match self {
            Self::NotFound(s) | Self::Forbidden(s) | Self::Api(s) => Some(s),
            Self::UnsupportedStrategy { status, .. } => Some(status),
            Self::Discovery(_) | Self::Transport(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Why a reconciliation run stopped.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Conflicting or malformed options; raised before any cluster call.
    #[error("configuration: {0}")]
    Configuration(String),
    /// An optional collaborator was requested but not supplied.
    #[error("capability: {0}")]
    Capability(String),
    #[error("invalid definition: {0}")]
    Definition(String),
    #[error("{msg}")]
    Validation { msg: String, issues: Vec<ValidationIssue> },
    #[error("{msg}")]
    Cluster {
        msg: String,
        #[source]
        source: ClientError,
    },
    #[error("{msg}")]
    WaitTimeout { msg: String, elapsed: u64, last_observed: Option<Json> },
    #[error("{msg}")]
    WaitFailed {
        msg: String,
        elapsed: u64,
        #[source]
        source: ClientError,
    },
}

impl ReconcileError {
    pub fn cluster(msg: impl Into<String>, source: ClientError) -> Self {
        Self::Cluster { msg: msg.into(), source }
    }

    /// Transport status code, when the failure came from the API server.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Cluster { source, .. } | Self::WaitFailed { source, .. } => source.status().map(|s| s.code),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Cluster { source, .. } | Self::WaitFailed { source, .. } => source.status().map(|s| s.reason.as_str()),
            Self::WaitTimeout { .. } => Some("Timeout"),
            Self::Configuration(_) => Some("InvalidConfiguration"),
            Self::Capability(_) => Some("MissingCapability"),
            Self::Definition(_) | Self::Validation { .. } => Some("Invalid"),
        }
    }

    pub fn last_observed(&self) -> Option<&Json> {
        match self {
            Self::WaitTimeout { last_observed, .. } => last_observed.as_ref(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        let mut out = json!({ "msg": self.to_string() });
        if let Some(code) = self.status() {
            out["error"] = json!(code);
            out["status"] = json!(code);
        }
        if let Some(reason) = self.reason() {
            out["reason"] = json!(reason);
        }
        match self {
            Self::Validation { issues, .. } => out["issues"] = json!(issues),
            Self::WaitTimeout { elapsed, .. } | Self::WaitFailed { elapsed, .. } => out["duration"] = json!(elapsed),
            _ => {}
        }
        out
    }
}

/// A failed run together with what it had already done to the cluster.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ReconcileFailure {
    /// True when a write landed before the failure (e.g. created, then wait timed out).
    pub changed: bool,
    pub method: Option<Method>,
    pub result: Option<Json>,
    #[source]
    pub error: ReconcileError,
}

impl ReconcileFailure {
    pub fn after_write(method: Method, result: Option<Json>, error: ReconcileError) -> Self {
        Self { changed: true, method: Some(method), result, error }
    }

    pub fn to_json(&self) -> Json {
        let mut out = self.error.to_json();
        out["changed"] = json!(self.changed);
        if let Some(m) = self.method {
            out["method"] = json!(m.as_str());
        }
        if let Some(r) = self.result.as_ref().or_else(|| self.error.last_observed()) {
            out["result"] = r.clone();
        }
        out
    }
}

impl From<ReconcileError> for ReconcileFailure {
    fn from(error: ReconcileError) -> Self {
        Self { changed: false, method: None, result: None, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_errors_expose_status_and_reason() {
        let err = ReconcileError::cluster("Failed to get object", ClientError::forbidden("no access"));
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.reason(), Some("Forbidden"));
        let j = err.to_json();
        assert_eq!(j["msg"], "Failed to get object");
        assert_eq!(j["error"], 403);
    }

    #[test]
    fn failure_after_write_reports_changed_and_last_observed() {
        let last = json!({"kind": "Deployment", "status": {"replicas": 1}});
        let err = ReconcileError::WaitTimeout { msg: "timed out".into(), elapsed: 120, last_observed: Some(last.clone()) };
        let failure = ReconcileFailure::after_write(Method::Create, None, err);
        let j = failure.to_json();
        assert_eq!(j["changed"], true);
        assert_eq!(j["method"], "create");
        assert_eq!(j["result"], last);
        assert_eq!(j["reason"], "Timeout");
        assert_eq!(j["duration"], 120);
    }

    #[test]
    fn transport_errors_have_no_status() {
        let err = ReconcileError::cluster("boom", ClientError::Transport("connection refused".into()));
        assert_eq!(err.status(), None);
        assert!(err.to_json().get("error").is_none());
    }
}
