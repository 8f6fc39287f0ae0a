//! Rekon kubehub: the [`ClusterClient`] backed by a live API server.
//!
//! Resources are resolved through kube discovery (once per group/version/kind)
//! and accessed as `DynamicObject`s, so any served kind (CRDs included) works.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use rekon_core::{ApiStatus, ClientError, ClusterClient, MergeStrategy, ObjectRef};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Message the API server returns when a resource has no strategic-merge schema.
const STRATEGIC_UNSUPPORTED: &str = "strategic merge patch format is not supported";

/// Build a kube client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig")
}

pub struct KubeCluster {
    client: Client,
    // (apiVersion, kind) -> resolved resource and whether it is namespaced
    resources: Mutex<HashMap<(String, String), (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    pub async fn connect() -> Result<Self> {
        let client = get_kube_client().await?;
        info!(default_ns = %client.default_namespace(), "connected to cluster");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), ClientError> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(hit) = self.resources.lock().ok().and_then(|m| m.get(&key).cloned()) {
            return Ok(hit);
        }
        let (group, version) = split_api_version(api_version);
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await
            .map_err(|e| ClientError::Discovery(e.to_string()))?;
        histogram!("kube_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        for g in discovery.groups() {
            if g.name() != group {
                continue;
            }
            for (ar, caps) in g.versioned_resources(version) {
                if ar.kind == kind {
                    let found = (ar, matches!(caps.scope, Scope::Namespaced));
                    debug!(api_version, kind, namespaced = found.1, plural = %found.0.plural, "resolved resource");
                    if let Ok(mut m) = self.resources.lock() {
                        m.insert(key, found.clone());
                    }
                    return Ok(found);
                }
            }
        }
        Err(ClientError::Discovery(format!("no resource of kind {} served under {}", kind, api_version)))
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = self.resolve(api_version, kind).await?;
        Ok(match scoped_namespace(namespaced, namespace, self.client.default_namespace()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, target: &ObjectRef) -> Result<Json, ClientError> {
        let api = self.api(&target.api_version, &target.kind, target.namespace.as_deref()).await?;
        let t0 = Instant::now();
        let res = api.get(&target.name).await;
        observe("get", t0, res.as_ref().err());
        to_json(res.map_err(|e| map_error(e, None))?)
    }

    async fn create(&self, api_version: &str, kind: &str, namespace: Option<&str>, payload: &Json) -> Result<Json, ClientError> {
        let api = self.api(api_version, kind, namespace).await?;
        let obj: DynamicObject =
            serde_json::from_value(payload.clone()).map_err(|e| ClientError::Transport(format!("encoding {}: {}", kind, e)))?;
        let t0 = Instant::now();
        let res = api.create(&PostParams::default(), &obj).await;
        observe("create", t0, res.as_ref().err());
        to_json(res.map_err(|e| map_error(e, None))?)
    }

    async fn patch(&self, target: &ObjectRef, strategy: MergeStrategy, payload: &Json) -> Result<Json, ClientError> {
        let api = self.api(&target.api_version, &target.kind, target.namespace.as_deref()).await?;
        let pp = PatchParams::default();
        let t0 = Instant::now();
        let res = match strategy {
            MergeStrategy::StrategicMerge => api.patch(&target.name, &pp, &Patch::Strategic(payload)).await,
            MergeStrategy::Merge => api.patch(&target.name, &pp, &Patch::Merge(payload)).await,
            MergeStrategy::Json => {
                let ops: json_patch::Patch = serde_json::from_value(payload.clone())
                    .map_err(|e| ClientError::Transport(format!("invalid json patch: {}", e)))?;
                api.patch(&target.name, &pp, &Patch::<()>::Json(ops)).await
            }
        };
        observe("patch", t0, res.as_ref().err());
        to_json(res.map_err(|e| map_error(e, Some(strategy)))?)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClientError> {
        let api = self.api(&target.api_version, &target.kind, target.namespace.as_deref()).await?;
        let t0 = Instant::now();
        let res = api.delete(&target.name, &DeleteParams::default()).await;
        observe("delete", t0, res.as_ref().err());
        res.map(|_| ()).map_err(|e| map_error(e, None))
    }
}

fn observe(verb: &'static str, t0: Instant, err: Option<&kube::Error>) {
    histogram!("kube_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
    if err.is_some() {
        counter!("kube_request_errors_total", 1u64, "verb" => verb);
    }
}

fn to_json(obj: DynamicObject) -> Result<Json, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Transport(format!("decoding response: {}", e)))
}

/// `apps/v1` -> (`apps`, `v1`); `v1` -> (``, `v1`).
fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.rsplit_once('/').unwrap_or(("", api_version))
}

/// Namespace an API handle is bound to; cluster-scoped kinds ignore the requested one.
fn scoped_namespace<'a>(namespaced: bool, requested: Option<&'a str>, default: &'a str) -> Option<&'a str> {
    if namespaced {
        Some(requested.unwrap_or(default))
    } else {
        None
    }
}

/// Fold a kube error into the closed client error set.
///
/// `strategy` is the patch type of the failed request, if it was a patch.
pub fn map_error(err: kube::Error, strategy: Option<MergeStrategy>) -> ClientError {
    match err {
        kube::Error::Api(ErrorResponse { code, reason, message, .. }) => {
            let unsupported = code == 415 || message.contains(STRATEGIC_UNSUPPORTED);
            let status = ApiStatus::new(code, reason, message);
            match (code, strategy) {
                (404, _) => ClientError::NotFound(status),
                (403, _) => ClientError::Forbidden(status),
                (_, Some(strategy)) if unsupported => ClientError::UnsupportedStrategy { strategy, status },
                _ => ClientError::Api(status),
            }
        }
        kube::Error::Discovery(e) => ClientError::Discovery(e.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}
