//! In-memory backing store and fixtures for unit tests.

use async_trait::async_trait;
use kube::{
    Resource, ResourceExt,
    api::{ApiResource, DynamicObject},
    core::ErrorResponse,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use skiperator_apis::{Application, ApplicationSpec};
use std::{collections::BTreeMap, sync::Mutex, time::Duration};

use crate::{store::ObjectStore, utils::NamespacedName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verb {
    Get,
    Create,
    Patch,
    MergeStatus,
}

/// A write observed by the [`MemoryStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Write {
    pub verb: Verb,
    pub kind: String,
    pub key: NamespacedName,
}

struct Failure {
    verb: Verb,
    kind: String,
    error: ErrorResponse,
}

type ObjectId = (String, String, NamespacedName);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectId, Value>,
    last_resource_version: u64,
    writes: Vec<Write>,
    failures: Vec<Failure>,
    latency: Option<Duration>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.last_resource_version += 1;
        self.last_resource_version.to_string()
    }

    fn take_failure(&mut self, verb: Verb, kind: &str) -> Option<kube::Error> {
        let idx = self
            .failures
            .iter()
            .position(|f| f.verb == verb && f.kind == kind)?;
        Some(kube::Error::Api(self.failures.remove(idx).error))
    }
}

/// Backing store keeping objects as JSON values, with resource versions, JSON patch
/// preconditions, merge patches for the status sub-resource and a simulated garbage
/// collector.
#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

fn error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn object_id(resource: &ApiResource, key: &NamespacedName) -> ObjectId {
    (resource.api_version.clone(), resource.kind.clone(), key.clone())
}

fn typed_id<K: Resource<DynamicType = ()>>(key: &NamespacedName) -> ObjectId {
    object_id(&ApiResource::erase::<K>(&()), key)
}

fn omit_empty_fields(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            for v in fields.values_mut() {
                omit_empty_fields(v);
            }
            fields.retain(|_, v| match v {
                Value::Null => false,
                Value::Array(items) => !items.is_empty(),
                Value::String(s) => !s.is_empty(),
                _ => true,
            });
        }
        Value::Array(items) => items.iter_mut().for_each(omit_empty_fields),
        _ => {}
    }
}

fn resource_version(value: &Value) -> Option<&str> {
    value["metadata"]["resourceVersion"].as_str()
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Delay every operation, used to exercise reconcile deadlines.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Fail the next `verb` on objects of `kind` with the given API error.
    pub fn fail_next(&self, verb: Verb, kind: &str, code: u16, reason: &str, message: &str) {
        self.lock().failures.push(Failure {
            verb,
            kind: kind.to_string(),
            error: ErrorResponse {
                status: "Failure".to_string(),
                message: message.to_string(),
                reason: reason.to_string(),
                code,
            },
        });
    }

    /// Store an object as if created by a user, assigning uid and resource version.
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, object: &K) {
        let key = NamespacedName::new(
            object.namespace().unwrap_or_default(),
            object.name_any(),
        );
        let mut value = serde_json::to_value(object).unwrap();
        let mut state = self.lock();
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = Value::from(format!("uid-{}", key));
        }
        value["metadata"]["resourceVersion"] = Value::from(state.next_resource_version());
        state.objects.insert(typed_id::<K>(&key), value);
    }

    pub fn get_typed<K: Resource<DynamicType = ()> + DeserializeOwned>(
        &self,
        key: &NamespacedName,
    ) -> Option<K> {
        self.lock()
            .objects
            .get(&typed_id::<K>(key))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Change an object outside of any controller, e.g. a user editing it.
    pub fn modify<K>(&self, key: &NamespacedName, f: impl FnOnce(&mut K))
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let mut state = self.lock();
        let id = typed_id::<K>(key);
        let mut object: K = serde_json::from_value(state.objects[&id].clone()).unwrap();
        f(&mut object);
        let mut value = serde_json::to_value(&object).unwrap();
        value["metadata"]["resourceVersion"] = Value::from(state.next_resource_version());
        state.objects.insert(id, value);
    }

    /// Rewrite a stored object the way the API server serves it back: fields declared with
    /// `omitempty` are dropped when they hold an empty list or string.
    pub fn omit_empty<K: Resource<DynamicType = ()>>(&self, key: &NamespacedName) {
        let mut state = self.lock();
        if let Some(value) = state.objects.get_mut(&typed_id::<K>(key)) {
            omit_empty_fields(value);
        }
    }

    /// Delete an object and, like the garbage collector, everything it (transitively) owns.
    pub fn delete_cascade<K: Resource<DynamicType = ()>>(&self, key: &NamespacedName) {
        let mut state = self.lock();
        let mut deleted_uids: Vec<String> = vec![];
        if let Some(value) = state.objects.remove(&typed_id::<K>(key)) {
            if let Some(uid) = value["metadata"]["uid"].as_str() {
                deleted_uids.push(uid.to_string());
            }
        }
        while let Some(uid) = deleted_uids.pop() {
            let owned: Vec<ObjectId> = state
                .objects
                .iter()
                .filter(|(_, v)| {
                    v["metadata"]["ownerReferences"]
                        .as_array()
                        .map_or(false, |refs| refs.iter().any(|r| r["uid"] == uid.as_str()))
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in owned {
                if let Some(value) = state.objects.remove(&id) {
                    if let Some(uid) = value["metadata"]["uid"].as_str() {
                        deleted_uids.push(uid.to_string());
                    }
                }
            }
        }
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// All objects owned by the object with the given uid.
    pub fn owned_by(&self, uid: &str) -> Vec<(String, NamespacedName)> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, v)| {
                v["metadata"]["ownerReferences"]
                    .as_array()
                    .map_or(false, |refs| refs.iter().any(|r| r["uid"] == uid))
            })
            .map(|((_, kind, key), _)| (kind.clone(), key.clone()))
            .collect()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    fn record(state: &mut State, verb: Verb, resource: &ApiResource, key: &NamespacedName) {
        state.writes.push(Write {
            verb,
            kind: resource.kind.clone(),
            key: key.clone(),
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
    ) -> kube::Result<Option<DynamicObject>> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(e) = state.take_failure(Verb::Get, &resource.kind) {
            return Err(e);
        }
        match state.objects.get(&object_id(resource, key)) {
            Some(value) => Ok(Some(
                serde_json::from_value(value.clone()).map_err(kube::Error::SerdeError)?,
            )),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        self.delay().await;
        let key = NamespacedName::from(object);
        let mut state = self.lock();
        if let Some(e) = state.take_failure(Verb::Create, &resource.kind) {
            return Err(e);
        }
        let id = object_id(resource, &key);
        if state.objects.contains_key(&id) {
            return Err(error(
                409,
                "AlreadyExists",
                format!("{} {} already exists", resource.kind, key),
            ));
        }
        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        let resource_version = state.next_resource_version();
        value["metadata"]["uid"] = Value::from(format!("uid-{}-{}", key, resource_version));
        value["metadata"]["resourceVersion"] = Value::from(resource_version);
        state.objects.insert(id, value.clone());
        Self::record(&mut state, Verb::Create, resource, &key);
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        patch: &json_patch::Patch,
    ) -> kube::Result<DynamicObject> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(e) = state.take_failure(Verb::Patch, &resource.kind) {
            return Err(e);
        }
        let id = object_id(resource, key);
        let mut value = match state.objects.get(&id) {
            Some(v) => v.clone(),
            None => {
                return Err(error(
                    404,
                    "NotFound",
                    format!("{} {} not found", resource.kind, key),
                ));
            }
        };
        for op in patch.0.iter() {
            let op = serde_json::to_value(op).map_err(kube::Error::SerdeError)?;
            if op["op"] == "test"
                && op["path"] == "/metadata/resourceVersion"
                && op["value"].as_str() != resource_version(&value)
            {
                return Err(error(
                    409,
                    "Conflict",
                    format!(
                        "Operation cannot be fulfilled on {} {}: the object has been modified",
                        resource.kind, key
                    ),
                ));
            }
        }
        json_patch::patch(&mut value, &patch.0)
            .map_err(|e| error(422, "Invalid", e.to_string()))?;
        value["metadata"]["resourceVersion"] = Value::from(state.next_resource_version());
        state.objects.insert(id, value.clone());
        Self::record(&mut state, Verb::Patch, resource, key);
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn merge_status(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        patch: &Value,
    ) -> kube::Result<()> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(e) = state.take_failure(Verb::MergeStatus, &resource.kind) {
            return Err(e);
        }
        let resource_version = state.next_resource_version();
        let value = match state.objects.get_mut(&object_id(resource, key)) {
            Some(v) => v,
            None => {
                return Err(error(
                    404,
                    "NotFound",
                    format!("{} {} not found", resource.kind, key),
                ));
            }
        };
        // The status sub-resource ignores everything but the status.
        let status_patch = serde_json::json!({ "status": patch["status"].clone() });
        json_patch::merge(value, &status_patch);
        value["metadata"]["resourceVersion"] = Value::from(resource_version);
        Self::record(&mut state, Verb::MergeStatus, resource, key);
        Ok(())
    }
}

/// An Application as created by a user: `{ns}/{name}`, image `nginx`, port 8080, 2-5 replicas.
pub(crate) fn application(namespace: &str, name: &str) -> Application {
    let spec: ApplicationSpec = serde_json::from_value(serde_json::json!({
        "image": "nginx:1.27",
        "port": 8080,
        "replicas": { "min": 2, "max": 5 },
    }))
    .unwrap();
    let mut app = Application::new(name, spec);
    app.metadata.namespace = Some(namespace.to_string());
    app.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    #[test]
    fn omits_empty_fields() {
        let mut value = serde_json::json!({
            "spec": {
                "ingress": [],
                "egress": [{"to": [], "ports": [{"port": 53}]}],
                "env": [{"name": "A", "value": ""}],
                "replicas": 0,
                "paused": null,
            }
        });
        omit_empty_fields(&mut value);
        assert_eq!(
            serde_json::json!({
                "spec": {
                    "egress": [{"ports": [{"port": 53}]}],
                    "env": [{"name": "A"}],
                    "replicas": 0,
                }
            }),
            value
        );
    }

    #[tokio::test]
    async fn merge_status_merges_per_key() {
        let store = MemoryStore::default();
        let app = application("team-a", "api");
        store.insert(&app);
        let resource = ApiResource::erase::<Application>(&());
        let key = NamespacedName::new("team-a", "api");
        store
            .merge_status(
                &resource,
                &key,
                &serde_json::json!({"status": {"controllers": {"A": {"phase": "Synced"}}}}),
            )
            .await
            .unwrap();
        store
            .merge_status(
                &resource,
                &key,
                &serde_json::json!({"status": {"controllers": {"B": {"phase": "Error", "reason": "x"}}}}),
            )
            .await
            .unwrap();
        let app: Application = store.get_typed(&key).unwrap();
        let status = app.status.unwrap();
        assert_eq!(2, status.controllers.len());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::default();
        let resource = ApiResource::erase::<Service>(&());
        let key = NamespacedName::new("team-a", "api");
        store.fail_next(Verb::Get, "Service", 503, "ServiceUnavailable", "down");
        assert!(store.get(&resource, &key).await.is_err());
        assert!(store.get(&resource, &key).await.unwrap().is_none());
    }
}
