use kube::ResourceExt;
use skiperator_apis::{
    Application, ControllerName,
    istio::{Gateway, Port, Server, ServerTlsSettings},
};
use std::collections::BTreeMap;

use super::{DependentResource, EGRESS_GATEWAY_SELECTOR, external_hosts};
use crate::errors::ControllerError;

/// Lets TLS traffic to the external hosts pass through the shared egress gateway.
pub(crate) struct EgressGateway;

impl DependentResource for EgressGateway {
    type Object = Gateway;

    const CONTROLLER: ControllerName = ControllerName::EgressGateway;

    fn name(app: &Application) -> String {
        format!("{}-egress", app.name_any())
    }

    fn is_needed(app: &Application) -> bool {
        !app.spec.access_policy.outbound.external.is_empty()
    }

    fn desired(app: &Application, gateway: &mut Gateway) -> Result<(), ControllerError> {
        // One server per port, listing every host reachable on it.
        let mut servers: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for (host, ports) in external_hosts(app)? {
            for p in ports {
                let hosts = servers.entry(p.port).or_default();
                if !hosts.contains(&host) {
                    hosts.push(host.clone());
                }
            }
        }
        gateway.spec.selector = BTreeMap::from([(
            EGRESS_GATEWAY_SELECTOR.0.to_string(),
            EGRESS_GATEWAY_SELECTOR.1.to_string(),
        )]);
        gateway.spec.servers = servers
            .into_iter()
            .map(|(number, hosts)| Server {
                port: Port {
                    number,
                    name: format!("tls-{}", number),
                    protocol: "TLS".to_string(),
                },
                hosts,
                tls: Some(ServerTlsSettings {
                    mode: "PASSTHROUGH".to_string(),
                    credential_name: None,
                }),
            })
            .collect();
        Ok(())
    }
}
