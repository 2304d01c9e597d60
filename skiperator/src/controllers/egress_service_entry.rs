use skiperator_apis::{
    Application, ControllerName,
    istio::{Port, ServiceEntry},
};

use super::{DependentResource, external_hosts};
use crate::errors::ControllerError;

/// Registers the external hosts of the application with the mesh. Without it the proxy
/// rejects the traffic, see [`super::Sidecar`].
pub(crate) struct EgressServiceEntry;

impl DependentResource for EgressServiceEntry {
    type Object = ServiceEntry;

    const CONTROLLER: ControllerName = ControllerName::EgressServiceEntry;

    fn is_needed(app: &Application) -> bool {
        !app.spec.access_policy.outbound.external.is_empty()
    }

    fn desired(app: &Application, entry: &mut ServiceEntry) -> Result<(), ControllerError> {
        let external = external_hosts(app)?;
        let mut ports: Vec<Port> = vec![];
        for p in external.iter().flat_map(|(_, ports)| ports.iter()) {
            if !ports.iter().any(|existing| existing.number == p.port) {
                ports.push(Port {
                    number: p.port,
                    name: p.name.clone(),
                    protocol: p.protocol.clone(),
                });
            }
        }
        entry.spec.hosts = external.into_iter().map(|(host, _)| host).collect();
        entry.spec.ports = ports;
        entry.spec.location = Some("MESH_EXTERNAL".to_string());
        entry.spec.resolution = Some("DNS".to_string());
        entry.spec.export_to = vec![".".to_string()];
        Ok(())
    }
}
