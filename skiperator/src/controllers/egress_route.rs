use kube::ResourceExt;
use skiperator_apis::{
    Application, ControllerName,
    istio::{Destination, PortSelector, RouteDestination, TlsMatchAttributes, TlsRoute, VirtualService},
};

use super::{DependentResource, ISTIO_NAMESPACE, external_hosts};
use crate::errors::ControllerError;

const MESH_GATEWAY: &str = "mesh";

/// Sends traffic to the external hosts through the egress gateway: from the sidecars to the
/// gateway and from the gateway out of the mesh, matched on SNI.
pub(crate) struct EgressRoute;

fn tls_route(gateway: &str, host: &str, port: i32, destination: &str) -> TlsRoute {
    TlsRoute {
        match_: vec![TlsMatchAttributes {
            sni_hosts: vec![host.to_string()],
            gateways: vec![gateway.to_string()],
            port: Some(port),
        }],
        route: vec![RouteDestination {
            destination: Destination {
                host: destination.to_string(),
                port: Some(PortSelector { number: port }),
            },
        }],
    }
}

impl DependentResource for EgressRoute {
    type Object = VirtualService;

    const CONTROLLER: ControllerName = ControllerName::EgressRoute;

    fn name(app: &Application) -> String {
        format!("{}-egress", app.name_any())
    }

    fn is_needed(app: &Application) -> bool {
        !app.spec.access_policy.outbound.external.is_empty()
    }

    fn desired(app: &Application, vs: &mut VirtualService) -> Result<(), ControllerError> {
        let gateway = Self::name(app);
        let egress_gateway_service =
            format!("istio-egressgateway.{}.svc.cluster.local", ISTIO_NAMESPACE);
        let external = external_hosts(app)?;
        let mut tls = vec![];
        for (host, ports) in external.iter() {
            for p in ports {
                tls.push(tls_route(MESH_GATEWAY, host, p.port, &egress_gateway_service));
                tls.push(tls_route(&gateway, host, p.port, host));
            }
        }
        vs.spec.hosts = external.into_iter().map(|(host, _)| host).collect();
        vs.spec.gateways = vec![MESH_GATEWAY.to_string(), gateway];
        vs.spec.export_to = vec![".".to_string()];
        vs.spec.tls = tls;
        Ok(())
    }
}
