//! Convergence predicates over live objects.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use rekon_core::capabilities::Readiness;
use rekon_core::{object, WaitCondition};
use serde_json::Value as Json;
use tracing::trace;

/// Whether `obj` satisfies the built-in predicate for its kind.
/// Objects that do not parse as the expected type are not ready.
pub fn is_ready(readiness: Readiness, obj: &Json) -> bool {
    let parsed = match readiness {
        Readiness::Deployment => serde_json::from_value::<Deployment>(obj.clone()).map(|d| deployment_ready(&d)),
        Readiness::DaemonSet => serde_json::from_value::<DaemonSet>(obj.clone()).map(|d| daemonset_ready(&d)),
        Readiness::StatefulSet => serde_json::from_value::<StatefulSet>(obj.clone()).map(|s| statefulset_ready(&s)),
        Readiness::Pod => serde_json::from_value::<Pod>(obj.clone()).map(|p| pod_ready(&p)),
    };
    parsed.unwrap_or_else(|e| {
        trace!(error = %e, ?readiness, "live object did not parse for readiness");
        false
    })
}

/// A status condition with the configured type, status and (if set) reason is present.
pub fn condition_met(obj: &Json, cond: &WaitCondition) -> bool {
    let field = |c: &Json, k: &str| c.get(k).and_then(|v| v.as_str()).map(str::to_string);
    object::conditions(obj)
        .iter()
        .find(|c| field(c, "type").as_deref() == Some(cond.type_.as_str()))
        .map_or(false, |c| {
            field(c, "status").as_deref() == Some(cond.status.as_str())
                && cond.reason.as_deref().map_or(true, |r| field(c, "reason").as_deref() == Some(r))
        })
}

fn deployment_ready(d: &Deployment) -> bool {
    let Some(status) = d.status.as_ref() else { return false };
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let replicas = status.replicas.unwrap_or(0);
    desired == replicas
        && status.available_replicas.unwrap_or(0) == replicas
        && status.observed_generation == d.metadata.generation
        && status.unavailable_replicas.unwrap_or(0) == 0
}

fn daemonset_ready(d: &DaemonSet) -> bool {
    let Some(status) = d.status.as_ref() else { return false };
    let desired = status.desired_number_scheduled;
    status.updated_number_scheduled.unwrap_or(0) == desired
        && status.number_ready == desired
        && status.observed_generation == d.metadata.generation
        && status.number_unavailable.unwrap_or(0) == 0
}

fn statefulset_ready(s: &StatefulSet) -> bool {
    let Some(status) = s.status.as_ref() else { return false };
    let spec = s.spec.as_ref();
    let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
    let rolling = spec
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        .map_or(true, |t| t == "RollingUpdate");
    // OnDelete never converges revisions on its own
    let revisions_settled = !rolling || status.update_revision == status.current_revision;
    status.observed_generation.unwrap_or(0) == s.metadata.generation.unwrap_or(0)
        && revisions_settled
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && status.replicas == desired
}

fn pod_ready(p: &Pod) -> bool {
    let Some(status) = p.status.as_ref() else { return false };
    if status.phase.as_deref() == Some("Succeeded") {
        return true;
    }
    status.container_statuses.as_ref().map_or(false, |cs| cs.iter().all(|c| c.ready))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::ConditionStatus;
    use serde_json::json;

    #[test]
    fn deployment_needs_observed_generation_and_available_replicas() {
        let mut d = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 2, "selector": {}, "template": {}},
            "status": {"observedGeneration": 1, "replicas": 2, "availableReplicas": 2}
        });
        assert!(!is_ready(Readiness::Deployment, &d));
        d["status"]["observedGeneration"] = json!(2);
        assert!(is_ready(Readiness::Deployment, &d));
        d["status"]["availableReplicas"] = json!(1);
        d["status"]["unavailableReplicas"] = json!(1);
        assert!(!is_ready(Readiness::Deployment, &d));
    }

    #[test]
    fn daemonset_counts_scheduled_and_ready() {
        let d = json!({
            "apiVersion": "apps/v1", "kind": "DaemonSet",
            "metadata": {"name": "agent", "generation": 1},
            "spec": {"selector": {}, "template": {}},
            "status": {"observedGeneration": 1, "desiredNumberScheduled": 3, "currentNumberScheduled": 3,
                       "numberMisscheduled": 0, "updatedNumberScheduled": 3, "numberReady": 2}
        });
        assert!(!is_ready(Readiness::DaemonSet, &d));
    }

    #[test]
    fn statefulset_waits_for_revision_rollout() {
        let mut s = json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": {"name": "db", "generation": 1},
            "spec": {"replicas": 1, "selector": {}, "serviceName": "db", "template": {}},
            "status": {"observedGeneration": 1, "replicas": 1, "readyReplicas": 1, "updatedReplicas": 1,
                       "currentRevision": "db-1", "updateRevision": "db-2"}
        });
        assert!(!is_ready(Readiness::StatefulSet, &s));
        s["status"]["currentRevision"] = json!("db-2");
        assert!(is_ready(Readiness::StatefulSet, &s));
    }

    #[test]
    fn pod_ready_when_all_containers_ready_or_succeeded() {
        let status = |ready: bool| json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"phase": "Running", "containerStatuses": [
                {"name": "a", "ready": true, "restartCount": 0, "image": "a", "imageID": ""},
                {"name": "b", "ready": ready, "restartCount": 0, "image": "b", "imageID": ""}
            ]}
        });
        assert!(is_ready(Readiness::Pod, &status(true)));
        assert!(!is_ready(Readiness::Pod, &status(false)));
        let done = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}, "status": {"phase": "Succeeded"}});
        assert!(is_ready(Readiness::Pod, &done));
        assert!(!is_ready(Readiness::Pod, &json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}})));
    }

    #[test]
    fn condition_match_checks_status_and_optional_reason() {
        let obj = json!({"status": {"conditions": [
            {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"},
            {"type": "Progressing", "status": "False"}
        ]}});
        let cond = |t: &str, s: ConditionStatus, r: Option<&str>| WaitCondition { type_: t.into(), status: s, reason: r.map(String::from) };
        assert!(condition_met(&obj, &cond("Available", ConditionStatus::True, None)));
        assert!(condition_met(&obj, &cond("Available", ConditionStatus::True, Some("MinimumReplicasAvailable"))));
        assert!(!condition_met(&obj, &cond("Available", ConditionStatus::True, Some("Other"))));
        assert!(condition_met(&obj, &cond("Progressing", ConditionStatus::False, None)));
        assert!(!condition_met(&obj, &cond("Progressing", ConditionStatus::True, None)));
        assert!(!condition_met(&obj, &cond("Ready", ConditionStatus::True, None)));
    }
}
