use kube::ResourceExt;
use skiperator_apis::{
    Application, ControllerName,
    istio::{Destination, HttpRoute, PortSelector, RouteDestination, VirtualService},
};

use super::{DependentResource, ingress_hosts, validate_port};
use crate::errors::ControllerError;

/// Routes requests for the ingress hosts from the ingress gateway to the Service.
pub(crate) struct IngressRoute;

impl DependentResource for IngressRoute {
    type Object = VirtualService;

    const CONTROLLER: ControllerName = ControllerName::IngressRoute;

    fn name(app: &Application) -> String {
        format!("{}-ingress", app.name_any())
    }

    fn is_needed(app: &Application) -> bool {
        !app.spec.ingresses.is_empty()
    }

    fn desired(app: &Application, vs: &mut VirtualService) -> Result<(), ControllerError> {
        vs.spec.hosts = ingress_hosts(app)?;
        vs.spec.gateways = vec![Self::name(app)];
        vs.spec.http = vec![HttpRoute {
            route: vec![RouteDestination {
                destination: Destination {
                    host: app.name_any(),
                    port: Some(PortSelector {
                        number: validate_port("port", app.spec.port)?,
                    }),
                },
            }],
        }];
        Ok(())
    }
}
