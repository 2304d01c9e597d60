use k8s_openapi::api::{
    apps::v1::Deployment, autoscaling::v2::HorizontalPodAutoscaler, core::v1::Service,
    networking::v1::NetworkPolicy,
};
use kube::{
    Client, Resource, discovery,
    api::{ApiResource, GroupVersionKind},
};
use skiperator_apis::{
    Application,
    istio::{Gateway, PeerAuthentication, ServiceEntry, Sidecar, VirtualService},
};
use std::collections::HashMap;

use crate::errors::ControllerError;

/// Registry of all object kinds the operator reads or writes.
///
/// Built once at startup and shared read-only by all controllers. Controllers resolve the
/// [`ApiResource`] of their dependent kind here, an unregistered kind fails the
/// reconciliation instead of talking to an unknown API.
#[derive(Clone, Debug, Default)]
pub(crate) struct KindRegistry {
    kinds: HashMap<GroupVersionKind, ApiResource>,
}

impl KindRegistry {
    /// Registry containing the Application and all dependent kinds.
    pub fn new() -> Self {
        Self::default()
            .register::<Application>()
            .register::<Deployment>()
            .register::<HorizontalPodAutoscaler>()
            .register::<NetworkPolicy>()
            .register::<Service>()
            .register::<Sidecar>()
            .register::<PeerAuthentication>()
            .register::<Gateway>()
            .register::<VirtualService>()
            .register::<ServiceEntry>()
    }

    pub fn register<K: Resource<DynamicType = ()>>(mut self) -> Self {
        let api_resource = ApiResource::erase::<K>(&());
        self.kinds.insert(gvk(&api_resource), api_resource);
        self
    }

    pub fn api_resource<K: Resource<DynamicType = ()>>(
        &self,
    ) -> Result<&ApiResource, ControllerError> {
        let wanted = GroupVersionKind {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        };
        self.kinds.get(&wanted).ok_or_else(|| {
            ControllerError::UnknownKind(format!(
                "kind {}/{}/{} is not registered",
                wanted.group, wanted.version, wanted.kind
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Check that the API server serves every registered kind. Missing kinds (e.g. Istio
    /// not installed) are only logged, the affected controllers report the error in the
    /// status of each Application.
    pub async fn verify(&self, client: &Client) -> usize {
        let mut missing = 0;
        for gvk in self.kinds.keys() {
            match discovery::pinned_kind(client, gvk).await {
                Ok(_) => debug!("kind {}/{}/{} is served", gvk.group, gvk.version, gvk.kind),
                Err(e) => {
                    missing += 1;
                    warn!(
                        "kind {}/{}/{} is not served by the API server: {}",
                        gvk.group, gvk.version, gvk.kind, e
                    );
                }
            }
        }
        missing
    }
}

fn gvk(api_resource: &ApiResource) -> GroupVersionKind {
    GroupVersionKind {
        group: api_resource.group.clone(),
        version: api_resource.version.clone(),
        kind: api_resource.kind.clone(),
    }
}
