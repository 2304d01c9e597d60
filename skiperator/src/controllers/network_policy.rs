use k8s_openapi::api::networking::v1 as networkingv1;
use serde_json::{Value, json};
use skiperator_apis::{Application, ControllerName};

use super::{
    DependentResource, EGRESS_GATEWAY_SELECTOR, INGRESS_GATEWAY_SELECTOR, ISTIO_NAMESPACE,
    validate_port,
};
use crate::errors::ControllerError;

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Restricts traffic of the application pods to the access policy of the Application.
///
/// Ingress is allowed from the inbound rules and, if the application has ingresses, from
/// the Istio ingress gateway. Egress is allowed to the outbound rules, to the Istio egress
/// gateway for external hosts and to the cluster DNS.
pub(crate) struct NetworkPolicy;

fn peer(namespace: &str, label: (&str, &str)) -> Value {
    json!({
        "namespaceSelector": {"matchLabels": {NAMESPACE_NAME_LABEL: namespace}},
        "podSelector": {"matchLabels": {label.0: label.1}},
    })
}

impl DependentResource for NetworkPolicy {
    type Object = networkingv1::NetworkPolicy;

    const CONTROLLER: ControllerName = ControllerName::NetworkPolicy;

    fn desired(
        app: &Application,
        policy: &mut networkingv1::NetworkPolicy,
    ) -> Result<(), ControllerError> {
        let namespace = app.metadata.namespace.as_deref().unwrap_or_default();
        let port = validate_port("port", app.spec.port)?;
        let policy_ports = json!([{"port": port, "protocol": "TCP"}]);

        let mut ingress: Vec<Value> = app
            .spec
            .access_policy
            .inbound
            .rules
            .iter()
            .map(|rule| {
                json!({
                    "from": [peer(rule.namespace_or(namespace), ("app", rule.application.as_str()))],
                    "ports": policy_ports,
                })
            })
            .collect();
        if !app.spec.ingresses.is_empty() {
            ingress.push(json!({
                "from": [peer(ISTIO_NAMESPACE, INGRESS_GATEWAY_SELECTOR)],
                "ports": policy_ports,
            }));
        }

        let mut egress: Vec<Value> = app
            .spec
            .access_policy
            .outbound
            .rules
            .iter()
            .map(|rule| {
                json!({
                    "to": [peer(rule.namespace_or(namespace), ("app", rule.application.as_str()))],
                })
            })
            .collect();
        if !app.spec.access_policy.outbound.external.is_empty() {
            egress.push(json!({
                "to": [peer(ISTIO_NAMESPACE, EGRESS_GATEWAY_SELECTOR)],
            }));
        }
        egress.push(json!({
            "to": [peer("kube-system", ("k8s-app", "kube-dns"))],
            "ports": [
                {"port": 53, "protocol": "UDP"},
                {"port": 53, "protocol": "TCP"},
            ],
        }));

        // The API server drops empty rule lists, an empty list here would never converge.
        let mut spec = json!({
            "podSelector": {"matchLabels": app.selector_labels()},
            "policyTypes": ["Ingress", "Egress"],
            "egress": egress,
        });
        if !ingress.is_empty() {
            spec["ingress"] = Value::Array(ingress);
        }
        policy.spec = Some(serde_json::from_value(spec)?);
        Ok(())
    }
}
