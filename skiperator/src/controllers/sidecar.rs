use skiperator_apis::{
    Application, ControllerName,
    istio::{self, OutboundTrafficPolicy, OutboundTrafficPolicyMode, WorkloadSelector},
};

use super::DependentResource;
use crate::errors::ControllerError;

/// Limits outbound traffic of the application's proxy to services known to the mesh.
pub(crate) struct Sidecar;

impl DependentResource for Sidecar {
    type Object = istio::Sidecar;

    const CONTROLLER: ControllerName = ControllerName::Sidecar;

    fn desired(app: &Application, sidecar: &mut istio::Sidecar) -> Result<(), ControllerError> {
        sidecar.spec.workload_selector = Some(WorkloadSelector::new(app.selector_labels()));
        sidecar.spec.outbound_traffic_policy = Some(OutboundTrafficPolicy {
            mode: OutboundTrafficPolicyMode::RegistryOnly,
        });
        Ok(())
    }
}
