use kube::ResourceExt;
use skiperator_apis::{
    Application, ControllerName,
    istio::{Gateway, Port, Server, ServerTlsSettings},
};
use std::collections::BTreeMap;

use super::{DependentResource, INGRESS_GATEWAY_SELECTOR, ingress_hosts};
use crate::errors::ControllerError;

/// Binds the ingress hosts of the application to the shared ingress gateway, plain HTTP on
/// port 80 and TLS terminated at the gateway on port 443.
pub(crate) struct IngressGateway;

impl DependentResource for IngressGateway {
    type Object = Gateway;

    const CONTROLLER: ControllerName = ControllerName::IngressGateway;

    fn name(app: &Application) -> String {
        format!("{}-ingress", app.name_any())
    }

    fn is_needed(app: &Application) -> bool {
        !app.spec.ingresses.is_empty()
    }

    fn desired(app: &Application, gateway: &mut Gateway) -> Result<(), ControllerError> {
        let hosts = ingress_hosts(app)?;
        gateway.spec.selector = BTreeMap::from([(
            INGRESS_GATEWAY_SELECTOR.0.to_string(),
            INGRESS_GATEWAY_SELECTOR.1.to_string(),
        )]);
        gateway.spec.servers = vec![
            Server {
                port: Port {
                    number: 80,
                    name: "http".to_string(),
                    protocol: "HTTP".to_string(),
                },
                hosts: hosts.clone(),
                tls: None,
            },
            Server {
                port: Port {
                    number: 443,
                    name: "https".to_string(),
                    protocol: "HTTPS".to_string(),
                },
                hosts,
                tls: Some(ServerTlsSettings {
                    mode: "SIMPLE".to_string(),
                    // Certificates live in the namespace of the ingress gateway, so the
                    // secret name carries the namespace of the application.
                    credential_name: Some(format!(
                        "{}-{}-ingress",
                        app.namespace().unwrap_or_default(),
                        app.name_any()
                    )),
                }),
            },
        ];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{controllers::tests::full_application, testing::application};

    #[test]
    fn http_and_https_servers() {
        let app = full_application();
        let mut gateway = Gateway::default();
        IngressGateway::desired(&app, &mut gateway).unwrap();
        assert_eq!(Some(&"external".to_string()), gateway.spec.selector.get("ingress"));
        let servers = &gateway.spec.servers;
        assert_eq!(2, servers.len());
        assert_eq!(80, servers[0].port.number);
        assert_eq!(vec!["api.kartverket.no".to_string()], servers[0].hosts);
        assert!(servers[0].tls.is_none());
        let tls = servers[1].tls.as_ref().unwrap();
        assert_eq!("SIMPLE", tls.mode);
        assert_eq!(Some("team-a-api-ingress".to_string()), tls.credential_name);
    }

    #[test]
    fn without_ingresses() {
        assert!(!IngressGateway::is_needed(&application("team-a", "api")));
        assert!(IngressGateway::is_needed(&full_application()));
    }

    #[test]
    fn rejects_urls() {
        let mut app = application("team-a", "api");
        app.spec.ingresses = vec!["https://api.kartverket.no".to_string()];
        let err = IngressGateway::desired(&app, &mut Gateway::default()).unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }
}
