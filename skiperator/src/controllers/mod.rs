//! The desired state of every dependent resource of an Application.
//!
//! Each controller is a [`DependentResource`]: the kind it owns, the name of its object and
//! a pure function deriving the object from the Application. Everything else (fetching,
//! ownership, diffing, status) is shared by [`ApplicationController`].

use futures::{FutureExt, future::BoxFuture};
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use skiperator_apis::{Application, ControllerName, ExternalPort};
use std::{fmt::Debug, sync::Arc};

use crate::{
    Configuration, application_controller::ApplicationController, errors::ControllerError,
    registry::KindRegistry, store::ObjectStore,
};

mod autoscaler;
mod egress_gateway;
mod egress_route;
mod egress_service_entry;
mod ingress_gateway;
mod ingress_route;
mod network_policy;
mod peer_authentication;
mod service;
mod sidecar;
mod workload;

pub(crate) use autoscaler::Autoscaler;
pub(crate) use egress_gateway::EgressGateway;
pub(crate) use egress_route::EgressRoute;
pub(crate) use egress_service_entry::EgressServiceEntry;
pub(crate) use ingress_gateway::IngressGateway;
pub(crate) use ingress_route::IngressRoute;
pub(crate) use network_policy::NetworkPolicy;
pub(crate) use peer_authentication::PeerAuthentication;
pub(crate) use service::Service;
pub(crate) use sidecar::Sidecar;
pub(crate) use workload::Workload;

/// Namespace of the Istio gateways.
pub(crate) const ISTIO_NAMESPACE: &str = "istio-system";

/// Labels of the shared ingress gateway pods.
pub(crate) const INGRESS_GATEWAY_SELECTOR: (&str, &str) = ("ingress", "external");

/// Labels of the shared egress gateway pods.
pub(crate) const EGRESS_GATEWAY_SELECTOR: (&str, &str) = ("egress", "external");

/// A dependent resource of an [`Application`], reconciled by its own controller.
pub(crate) trait DependentResource: Send + Sync + 'static {
    type Object: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Default
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Name of the controller, also the key of its status entry.
    const CONTROLLER: ControllerName;

    /// Name of the dependent object, it lives in the namespace of the Application.
    fn name(app: &Application) -> String {
        app.name_any()
    }

    /// Whether the Application has anything to publish through this dependent. When it
    /// has not, no object is created and an existing one is left alone.
    fn is_needed(_app: &Application) -> bool {
        true
    }

    /// Populate the desired state of `object` from the Application.
    ///
    /// `object` is either empty or a copy of the current object. Only the fields owned by
    /// the operator are set, everything else (e.g. defaults of the API server) is kept.
    fn desired(app: &Application, object: &mut Self::Object) -> Result<(), ControllerError>;
}

/// Start one controller per dependent resource.
pub(crate) fn start_all(
    configuration: &Configuration,
    kinds: &Arc<KindRegistry>,
    store: &Arc<dyn ObjectStore>,
    client: &Client,
) -> Result<Vec<BoxFuture<'static, ()>>, ControllerError> {
    Ok(vec![
        start::<Workload>(configuration, kinds, store, client)?,
        start::<Autoscaler>(configuration, kinds, store, client)?,
        start::<NetworkPolicy>(configuration, kinds, store, client)?,
        start::<Service>(configuration, kinds, store, client)?,
        start::<Sidecar>(configuration, kinds, store, client)?,
        start::<PeerAuthentication>(configuration, kinds, store, client)?,
        start::<IngressGateway>(configuration, kinds, store, client)?,
        start::<IngressRoute>(configuration, kinds, store, client)?,
        start::<EgressServiceEntry>(configuration, kinds, store, client)?,
        start::<EgressGateway>(configuration, kinds, store, client)?,
        start::<EgressRoute>(configuration, kinds, store, client)?,
    ])
}

fn start<D: DependentResource>(
    configuration: &Configuration,
    kinds: &Arc<KindRegistry>,
    store: &Arc<dyn ObjectStore>,
    client: &Client,
) -> Result<BoxFuture<'static, ()>, ControllerError> {
    let controller =
        ApplicationController::<D>::new(configuration.clone(), kinds.clone(), store.clone())?;
    info!("starting controller {}", D::CONTROLLER);
    Ok(controller.start(client.clone()).boxed())
}

/// Checks a port number.
pub(crate) fn validate_port(what: &str, port: i32) -> Result<i32, ControllerError> {
    if (1..=65535).contains(&port) {
        Ok(port)
    } else {
        Err(ControllerError::validation(format!(
            "{} {} is out of range 1-65535",
            what, port
        )))
    }
}

/// Checks that `host` is a plain DNS name, e.g. no URL, port or wildcard.
pub(crate) fn validate_hostname(host: &str) -> Result<(), ControllerError> {
    let invalid = |why: &str| {
        Err(ControllerError::validation(format!(
            "host {:?} is not a valid DNS name: {}",
            host, why
        )))
    };
    if host.is_empty() || host.len() > 253 {
        return invalid("length must be 1-253");
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return invalid("labels must have 1-63 characters");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return invalid("only lowercase letters, digits, '-' and '.' are allowed");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels must not start or end with '-'");
        }
    }
    Ok(())
}

/// Validated ingress hostnames of the Application.
pub(crate) fn ingress_hosts(app: &Application) -> Result<Vec<String>, ControllerError> {
    for host in app.spec.ingresses.iter() {
        validate_hostname(host)?;
    }
    Ok(app.spec.ingresses.clone())
}

/// Validated external hosts of the Application with their ports.
pub(crate) fn external_hosts(
    app: &Application,
) -> Result<Vec<(String, Vec<ExternalPort>)>, ControllerError> {
    app.spec
        .access_policy
        .outbound
        .external
        .iter()
        .map(|rule| {
            validate_hostname(&rule.host)?;
            let ports = rule.ports();
            for p in ports.iter() {
                validate_port(&format!("port {} of host {}", p.name, rule.host), p.port)?;
            }
            Ok((rule.host.clone(), ports))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing;
    use skiperator_apis::ApplicationSpec;

    /// An application with every optional feature in use.
    pub(crate) fn full_application() -> Application {
        let mut app = testing::application("team-a", "api");
        app.spec = serde_json::from_value::<ApplicationSpec>(serde_json::json!({
            "image": "ghcr.io/kartverket/api:1.2.3",
            "command": ["/bin/api", "serve"],
            "port": 8080,
            "additionalPorts": [{"name": "metrics", "port": 9090}],
            "env": [{"name": "LOG_LEVEL", "value": "debug"}],
            "replicas": {"min": 3, "max": 10, "targetCpuUtilization": 70},
            "ingresses": ["api.kartverket.no"],
            "accessPolicy": {
                "inbound": {"rules": [{"application": "web"}]},
                "outbound": {
                    "rules": [{"namespace": "team-b", "application": "db"}],
                    "external": [
                        {"host": "example.com"},
                        {"host": "pg.example.com", "ports": [{"name": "pg", "port": 5432, "protocol": "TCP"}]}
                    ]
                }
            }
        }))
        .unwrap();
        app
    }

    #[test]
    fn ports() {
        assert_eq!(8080, validate_port("port", 8080).unwrap());
        assert!(validate_port("port", 0).is_err());
        assert!(validate_port("port", 65536).is_err());
        let err = validate_port("additional port metrics", -1).unwrap_err();
        assert_eq!(
            "invalid application spec: additional port metrics -1 is out of range 1-65535",
            err.to_string()
        );
    }

    #[test]
    fn hostnames() {
        for host in ["example.com", "api.kartverket.no", "a-b.c1"] {
            assert!(validate_hostname(host).is_ok(), "{}", host);
        }
        for host in [
            "",
            "https://example.com",
            "example.com/path",
            "example.com:443",
            "*.example.com",
            "-a.example.com",
            "Example.com",
            "a..b",
        ] {
            assert!(validate_hostname(host).is_err(), "{}", host);
        }
    }

    #[test]
    fn external_hosts_default_to_https() {
        let hosts = external_hosts(&full_application()).unwrap();
        assert_eq!(2, hosts.len());
        assert_eq!("example.com", hosts[0].0);
        assert_eq!(vec![ExternalPort::default()], hosts[0].1);
        assert_eq!(5432, hosts[1].1[0].port);

        let mut app = full_application();
        app.spec.access_policy.outbound.external[0].host = "https://example.com".to_string();
        assert!(external_hosts(&app).is_err());
    }

    #[test]
    fn names_are_unique_per_kind() {
        let app = full_application();
        // Gateways and virtual services are shared by ingress and egress.
        assert_ne!(IngressGateway::name(&app), EgressGateway::name(&app));
        assert_ne!(IngressRoute::name(&app), EgressRoute::name(&app));
        assert_eq!("api", Workload::name(&app));
        assert_eq!("api-ingress", IngressGateway::name(&app));
        assert_eq!("api-egress", EgressRoute::name(&app));
    }
}
