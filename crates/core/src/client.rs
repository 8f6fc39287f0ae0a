//! Collaborator seams: the cluster client (doubling as resolver) and the schema validator.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{ClientError, MergeStrategy, ObjectRef};

/// Cluster access used by the reconciler. Every call returns either the
/// resulting object or one of the closed [`ClientError`] variants.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the live object.
    async fn get(&self, target: &ObjectRef) -> Result<Json, ClientError>;

    /// Create `payload` as a `kind` object in `namespace` (cluster-scoped when `None`).
    async fn create(&self, api_version: &str, kind: &str, namespace: Option<&str>, payload: &Json) -> Result<Json, ClientError>;

    /// Patch the live object. For [`MergeStrategy::Json`] the payload is an array of RFC 6902 operations.
    async fn patch(&self, target: &ObjectRef, strategy: MergeStrategy, payload: &Json) -> Result<Json, ClientError>;

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClientError>;
}

#[async_trait::async_trait]
impl<C: ClusterClient + ?Sized> ClusterClient for std::sync::Arc<C> {
    async fn get(&self, target: &ObjectRef) -> Result<Json, ClientError> {
        (**self).get(target).await
    }

    async fn create(&self, api_version: &str, kind: &str, namespace: Option<&str>, payload: &Json) -> Result<Json, ClientError> {
        (**self).create(api_version, kind, namespace, payload).await
    }

    async fn patch(&self, target: &ObjectRef, strategy: MergeStrategy, payload: &Json) -> Result<Json, ClientError> {
        (**self).patch(target, strategy, payload).await
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClientError> {
        (**self).delete(target).await
    }
}

/// One finding from schema validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSON pointer into the definition (`""` for the document root).
    pub path: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self { path: path.into(), error: error.into(), hint: None }
    }

    pub fn render(&self) -> String {
        let at = if self.path.is_empty() { "/" } else { self.path.as_str() };
        match &self.hint {
            Some(h) => format!("{}: {} ({})", at, self.error, h),
            None => format!("{}: {}", at, self.error),
        }
    }
}

/// Validates a definition against the API schema before any cluster write.
#[async_trait::async_trait]
pub trait Validator: Send + Sync {
    /// Return the issues found (empty when valid). `Err` means validation itself could not run.
    async fn validate(&self, definition: &Json, version: Option<&str>, strict: bool) -> anyhow::Result<Vec<ValidationIssue>>;
}
