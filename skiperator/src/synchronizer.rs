use json_patch::{PatchOperation, diff};
use kube::{
    Resource,
    api::{ApiResource, DynamicObject},
};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

use crate::{
    errors::ControllerError,
    store::ObjectStore,
    utils::{NamespacedName, from_dynamic, to_dynamic},
};

/// The write needed to converge a dependent object, as computed by [`Synchronizer::plan`].
#[derive(Debug, Clone)]
pub(crate) enum SyncPlan {
    /// The object does not exist yet.
    Create(DynamicObject),
    /// The object exists but differs, the patch starts with a resource version precondition.
    Patch(json_patch::Patch),
    /// The object already is in the desired state.
    Unchanged,
}

impl SyncPlan {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, SyncPlan::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl OperationResult {
    pub fn changed(&self) -> bool {
        !matches!(self, OperationResult::Unchanged)
    }
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationResult::Created => f.write_str("created"),
            OperationResult::Updated => f.write_str("updated"),
            OperationResult::Unchanged => f.write_str("unchanged"),
        }
    }
}

/// Create-or-patch of a single object against the backing store.
///
/// The `mutate` function is the only source of the desired state: it is applied to a
/// fresh object if none exists yet, otherwise to a copy of the current object. The whole
/// object is then diffed against the current one, so fields `mutate` does not touch (e.g.
/// defaults filled in by the API server) are left alone.
#[derive(Clone)]
pub(crate) struct Synchronizer {
    store: Arc<dyn ObjectStore>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Fetch the current object and compute the write needed to reach the desired state.
    /// Only reads from the backing store.
    pub async fn plan<K, F>(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        mutate: F,
    ) -> Result<SyncPlan, ControllerError>
    where
        K: Resource<DynamicType = ()> + Clone + Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut K) -> Result<(), ControllerError>,
    {
        match self.store.get(resource, key).await? {
            None => {
                let mut object = K::default();
                object.meta_mut().name = Some(key.name.clone());
                object.meta_mut().namespace = Some(key.namespace.clone());
                mutate(&mut object)?;
                Ok(SyncPlan::Create(to_dynamic(&object)?))
            }
            Some(current) => {
                let current: K = from_dynamic(&current)?;
                let mut desired = current.clone();
                mutate(&mut desired)?;
                let mut patch = diff(
                    &serde_json::to_value(&current)?,
                    &serde_json::to_value(&desired)?,
                );
                if patch.0.is_empty() {
                    Ok(SyncPlan::Unchanged)
                } else {
                    if let Some(resource_version) = current.meta().resource_version.as_deref() {
                        patch
                            .0
                            .insert(0, resource_version_precondition(resource_version)?);
                    }
                    Ok(SyncPlan::Patch(patch))
                }
            }
        }
    }

    /// Execute a plan, at most one write.
    pub async fn apply(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        plan: SyncPlan,
    ) -> Result<OperationResult, ControllerError> {
        match plan {
            SyncPlan::Create(object) => {
                self.store.create(resource, &object).await?;
                Ok(OperationResult::Created)
            }
            SyncPlan::Patch(patch) => {
                debug!(
                    "patch {} {} with {}",
                    resource.kind,
                    key,
                    serde_json::to_string(&patch)?
                );
                self.store.patch(resource, key, &patch).await?;
                Ok(OperationResult::Updated)
            }
            SyncPlan::Unchanged => Ok(OperationResult::Unchanged),
        }
    }

    /// Create the object if absent, patch it if it differs from the desired state.
    pub async fn create_or_patch<K, F>(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        mutate: F,
    ) -> Result<OperationResult, ControllerError>
    where
        K: Resource<DynamicType = ()> + Clone + Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut K) -> Result<(), ControllerError>,
    {
        let plan = self.plan::<K, F>(resource, key, mutate).await?;
        self.apply(resource, key, plan).await
    }
}

/// JSON patch `test` operation making the patch fail with a conflict if the object was
/// modified since it was read.
fn resource_version_precondition(resource_version: &str) -> Result<PatchOperation, ControllerError> {
    Ok(serde_json::from_value(serde_json::json!({
        "op": "test",
        "path": "/metadata/resourceVersion",
        "value": resource_version,
    }))?)
}
