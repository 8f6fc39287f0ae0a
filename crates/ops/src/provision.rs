//! Request-based provisioning: kinds that cannot be created directly and are
//! instead requested through a companion kind (a Project through a ProjectRequest).

use metrics::counter;
use rekon_core::capabilities::Provisioning;
use rekon_core::{ClientError, ClusterClient, ObjectRef, ReconcileError};
use serde_json::{json, Value as Json};
use tracing::{info, warn};

/// Whether the failed initial lookup means "not there yet, request it".
///
/// A user who may not read the kind is usually still allowed to request one,
/// so Forbidden counts as well as NotFound.
pub fn is_provisioning_signal(target: &ObjectRef, err: &ClientError) -> bool {
    match err {
        ClientError::NotFound(_) => true,
        ClientError::Forbidden(status) => {
            warn!(object = %target, message = %status.message, "lookup forbidden; treating as absent and provisioning");
            true
        }
        _ => false,
    }
}

/// Submit `def` under the request kind and return what the server created.
pub async fn submit<C: ClusterClient + ?Sized>(
    client: &C,
    target: &ObjectRef,
    def: &Json,
    provisioning: Provisioning,
) -> Result<Json, ReconcileError> {
    let mut payload = def.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("kind".into(), json!(provisioning.request_kind));
    }
    info!(object = %target, request_kind = provisioning.request_kind, "provisioning through request kind");
    let created = client
        .create(&target.api_version, provisioning.request_kind, target.namespace.as_deref(), &payload)
        .await
        .map_err(|e| ReconcileError::cluster(format!("Failed to provision {}: {}", target, e), e))?;
    counter!("provision_total", 1u64);
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::fake::{Call, FakeCluster};

    #[test]
    fn only_not_found_and_forbidden_signal_provisioning() {
        let r = ObjectRef::new("project.openshift.io/v1", "Project", "demo", None);
        assert!(is_provisioning_signal(&r, &ClientError::not_found("missing")));
        assert!(is_provisioning_signal(&r, &ClientError::forbidden("no list")));
        assert!(!is_provisioning_signal(&r, &ClientError::Transport("connection reset".into())));
        assert!(!is_provisioning_signal(&r, &ClientError::Api(rekon_core::ApiStatus::new(500, "InternalError", "boom"))));
    }

    #[tokio::test]
    async fn submit_switches_kind_to_request_kind() {
        let fake = FakeCluster::new();
        let def = json!({"apiVersion": "project.openshift.io/v1", "kind": "Project", "metadata": {"name": "demo"}, "displayName": "Demo"});
        let r = ObjectRef::from_definition(&def).unwrap();
        let out = submit(&fake, &r, &def, Provisioning { request_kind: "ProjectRequest" }).await.unwrap();
        assert_eq!(out["kind"], "ProjectRequest");
        match &fake.writes()[0] {
            Call::Create { kind, payload } => {
                assert_eq!(kind, "ProjectRequest");
                assert_eq!(payload["displayName"], "Demo");
            }
            other => panic!("unexpected call {:?}", other),
        }
    }
}
