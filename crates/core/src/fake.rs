//! In-memory [`ClusterClient`] for tests: an object store with scripted replies and a call log.
//!
//! Patches are applied with the same semantics the API server uses closely
//! enough for reconciliation tests: RFC 7386 for merge, RFC 6902 for json, and
//! a keyed list merge for strategic merge.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::{json, Map, Value as Json};

use crate::{object, ApiStatus, ClientError, ClusterClient, MergeStrategy, ObjectRef};

/// Scripted reply for the next `get`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer from the object store.
    Live,
    Object(Json),
    Error(ClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(ObjectRef),
    Create { kind: String, payload: Json },
    Patch { target: ObjectRef, strategy: MergeStrategy, payload: Json },
    Delete(ObjectRef),
}

impl Call {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Get(_))
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Json>,
    get_replies: VecDeque<Reply>,
    rejected: Vec<MergeStrategy>,
    write_errors: VecDeque<ClientError>,
    calls: Vec<Call>,
    next_rv: u64,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

// Candidate merge keys, in order, for the strategic merge emulation.
const LIST_KEYS: &[&str] = &["name", "port", "containerPort", "mountPath", "devicePath", "type", "ip"];

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, obj: Json) -> Self {
        self.insert(obj);
        self
    }

    /// Store `obj` as-is (server fields are the caller's business).
    pub fn insert(&self, obj: Json) {
        if let Ok(r) = ObjectRef::from_definition(&obj) {
            self.state().objects.insert(r.key(), obj);
        }
    }

    pub fn object(&self, target: &ObjectRef) -> Option<Json> {
        self.state().objects.get(&target.key()).cloned()
    }

    /// Queue a reply for a future `get`; replies are consumed in order before the store is consulted.
    pub fn push_get(&self, reply: Reply) {
        self.state().get_replies.push_back(reply);
    }

    /// Answer every patch using `strategy` with an unsupported-media-type error.
    pub fn reject_strategy(&self, strategy: MergeStrategy) {
        self.state().rejected.push(strategy);
    }

    /// Fail the next write call (create, patch, delete) with `err`.
    pub fn fail_next_write(&self, err: ClientError) {
        self.state().write_errors.push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.state().calls.iter().filter(|c| c.is_write()).cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    fn bump(&mut self, obj: &mut Json) {
        self.next_rv += 1;
        if let Some(meta) = object::metadata_mut(obj) {
            meta.insert("resourceVersion".into(), json!(self.next_rv.to_string()));
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, target: &ObjectRef) -> Result<Json, ClientError> {
        let mut st = self.state();
        st.calls.push(Call::Get(target.clone()));
        match st.get_replies.pop_front().unwrap_or(Reply::Live) {
            Reply::Object(o) => Ok(o),
            Reply::Error(e) => Err(e),
            Reply::Live => st
                .objects
                .get(&target.key())
                .cloned()
                .ok_or_else(|| ClientError::not_found(format!("{} not found", target))),
        }
    }

    async fn create(&self, api_version: &str, kind: &str, namespace: Option<&str>, payload: &Json) -> Result<Json, ClientError> {
        let mut st = self.state();
        st.calls.push(Call::Create { kind: kind.to_string(), payload: payload.clone() });
        if let Some(e) = st.write_errors.pop_front() {
            return Err(e);
        }
        let mut obj = payload.clone();
        obj["apiVersion"] = json!(api_version);
        obj["kind"] = json!(kind);
        if let (Some(ns), Some(meta)) = (namespace, object::metadata_mut(&mut obj)) {
            meta.insert("namespace".into(), json!(ns));
        }
        let r = ObjectRef::from_definition(&obj).map_err(|e| ClientError::Api(ApiStatus::new(422, "Invalid", e.to_string())))?;
        if st.objects.contains_key(&r.key()) {
            return Err(ClientError::Api(ApiStatus::new(409, "AlreadyExists", format!("{} already exists", r))));
        }
        if let Some(meta) = object::metadata_mut(&mut obj) {
            meta.insert("uid".into(), json!(format!("uid-{}", r.name)));
            meta.insert("generation".into(), json!(1));
        }
        st.bump(&mut obj);
        st.objects.insert(r.key(), obj.clone());
        Ok(obj)
    }

    async fn patch(&self, target: &ObjectRef, strategy: MergeStrategy, payload: &Json) -> Result<Json, ClientError> {
        let mut st = self.state();
        st.calls.push(Call::Patch { target: target.clone(), strategy, payload: payload.clone() });
        if let Some(e) = st.write_errors.pop_front() {
            return Err(e);
        }
        if st.rejected.contains(&strategy) {
            return Err(ClientError::unsupported(strategy));
        }
        let mut obj = st
            .objects
            .get(&target.key())
            .cloned()
            .ok_or_else(|| ClientError::not_found(format!("{} not found", target)))?;
        let before_spec = obj.get("spec").cloned();
        match strategy {
            MergeStrategy::Merge => json_patch::merge(&mut obj, payload),
            MergeStrategy::StrategicMerge => strategic_merge(&mut obj, payload),
            MergeStrategy::Json => {
                let ops: json_patch::Patch = serde_json::from_value(payload.clone())
                    .map_err(|e| ClientError::Api(ApiStatus::new(400, "BadRequest", e.to_string())))?;
                json_patch::patch(&mut obj, &ops).map_err(|e| ClientError::Api(ApiStatus::new(422, "Invalid", e.to_string())))?;
            }
        }
        if obj.get("spec").cloned() != before_spec {
            let generation = obj.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64()).unwrap_or(0);
            if let Some(meta) = object::metadata_mut(&mut obj) {
                meta.insert("generation".into(), json!(generation + 1));
            }
        }
        st.bump(&mut obj);
        st.objects.insert(target.key(), obj.clone());
        Ok(obj)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClientError> {
        let mut st = self.state();
        st.calls.push(Call::Delete(target.clone()));
        if let Some(e) = st.write_errors.pop_front() {
            return Err(e);
        }
        match st.objects.remove(&target.key()) {
            Some(_) => Ok(()),
            None => Err(ClientError::not_found(format!("{} not found", target))),
        }
    }
}

fn strategic_merge(target: &mut Json, patch: &Json) {
    match (target, patch) {
        (Json::Object(t), Json::Object(p)) => {
            for (k, pv) in p {
                if pv.is_null() {
                    t.remove(k);
                    continue;
                }
                match t.get_mut(k) {
                    Some(tv) => strategic_merge(tv, pv),
                    None => {
                        t.insert(k.clone(), pv.clone());
                    }
                }
            }
        }
        (Json::Array(t), Json::Array(p)) => match shared_key(t.as_slice(), p) {
            Some(key) => {
                for pe in p {
                    match t.iter_mut().find(|te| te.get(key) == pe.get(key)) {
                        Some(te) => strategic_merge(te, pe),
                        None => t.push(pe.clone()),
                    }
                }
            }
            None => *t = p.clone(),
        },
        (t, p) => *t = p.clone(),
    }
}

fn shared_key(live: &[Json], patch: &[Json]) -> Option<&'static str> {
    let has = |e: &Json, k: &str| e.as_object().map_or(false, |m: &Map<String, Json>| m.contains_key(k));
    LIST_KEYS.iter().copied().find(|&k| !patch.is_empty() && patch.iter().chain(live.iter()).all(|e| has(e, k)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm() -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "ns"}, "data": {"a": "1"}})
    }

    #[tokio::test]
    async fn scripted_replies_take_precedence_over_store() {
        let fake = FakeCluster::new().with_object(cm());
        let r = ObjectRef::from_definition(&cm()).unwrap();
        fake.push_get(Reply::Error(ClientError::forbidden("nope")));
        assert!(matches!(fake.get(&r).await, Err(ClientError::Forbidden(_))));
        assert_eq!(fake.get(&r).await.unwrap()["data"]["a"], "1");
        assert_eq!(fake.calls().len(), 2);
        assert!(fake.writes().is_empty());
    }

    #[tokio::test]
    async fn strategic_merge_merges_keyed_lists() {
        let dep = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "ns"},
            "spec": {"template": {"spec": {"containers": [{"name": "app", "image": "a:1"}, {"name": "sidecar", "image": "s:1"}]}}}});
        let fake = FakeCluster::new().with_object(dep.clone());
        let r = ObjectRef::from_definition(&dep).unwrap();
        let patch = json!({"spec": {"template": {"spec": {"containers": [{"name": "app", "image": "a:2"}]}}}});
        let out = fake.patch(&r, MergeStrategy::StrategicMerge, &patch).await.unwrap();
        let containers = out["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["image"], "a:2");
    }

    #[tokio::test]
    async fn rejected_strategy_returns_unsupported() {
        let fake = FakeCluster::new().with_object(cm());
        fake.reject_strategy(MergeStrategy::StrategicMerge);
        let r = ObjectRef::from_definition(&cm()).unwrap();
        let err = fake.patch(&r, MergeStrategy::StrategicMerge, &json!({"data": {"b": "2"}})).await.unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedStrategy { .. }));
    }
}
