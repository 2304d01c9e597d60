//! Access to the backing store holding Applications and their dependent objects.
//!
//! Controllers only talk to the store through [`ObjectStore`], so the reconciliation
//! logic can be exercised against an in-memory store in tests.

use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, Patch, PatchParams, PostParams},
};

use crate::{MANAGER, utils::NamespacedName};

#[async_trait]
pub(crate) trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist.
    async fn get(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
    ) -> kube::Result<Option<DynamicObject>>;

    /// Create a new object, the namespace and name are taken from the object itself.
    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject>;

    /// Apply a JSON patch (RFC 6902). Any `test` operation in the patch acts as a
    /// precondition and fails the whole patch with a conflict if it does not hold.
    async fn patch(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        patch: &json_patch::Patch,
    ) -> kube::Result<DynamicObject>;

    /// Apply a JSON merge patch (RFC 7386) to the status sub-resource.
    async fn merge_status(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> kube::Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
pub(crate) struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
    ) -> kube::Result<Option<DynamicObject>> {
        self.namespaced_api(resource, key.namespace.as_str())
            .get_opt(key.name.as_str())
            .await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        self.namespaced_api(resource, namespace.as_str())
            .create(&pp, object)
            .await
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        patch: &json_patch::Patch,
    ) -> kube::Result<DynamicObject> {
        self.namespaced_api(resource, key.namespace.as_str())
            .patch(
                key.name.as_str(),
                &Self::patch_params(),
                &Patch::<json_patch::Patch>::Json(patch.clone()),
            )
            .await
    }

    async fn merge_status(
        &self,
        resource: &ApiResource,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> kube::Result<()> {
        self.namespaced_api(resource, key.namespace.as_str())
            .patch_status(
                key.name.as_str(),
                &Self::patch_params(),
                &Patch::Merge(patch),
            )
            .await?;
        Ok(())
    }
}
