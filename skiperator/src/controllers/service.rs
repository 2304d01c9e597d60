use k8s_openapi::{
    api::core::v1 as corev1, apimachinery::pkg::util::intstr::IntOrString,
};
use skiperator_apis::{Application, ControllerName};

use super::{DependentResource, validate_port};
use crate::errors::ControllerError;

/// Exposes the application inside the cluster. The main port is named `http`, so Istio
/// treats it as HTTP traffic.
pub(crate) struct Service;

fn service_port(name: &str, port: i32, protocol: &str) -> corev1::ServicePort {
    corev1::ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some(protocol.to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

impl DependentResource for Service {
    type Object = corev1::Service;

    const CONTROLLER: ControllerName = ControllerName::Service;

    fn desired(app: &Application, service: &mut corev1::Service) -> Result<(), ControllerError> {
        let mut ports = vec![service_port(
            "http",
            validate_port("port", app.spec.port)?,
            "TCP",
        )];
        for p in app.spec.additional_ports.iter() {
            ports.push(service_port(
                p.name.as_str(),
                validate_port(&format!("additional port {}", p.name), p.port)?,
                p.protocol.as_str(),
            ));
        }
        let spec = service.spec.get_or_insert_with(Default::default);
        spec.selector = Some(app.selector_labels());
        spec.ports = Some(ports);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{controllers::tests::full_application, testing::application};

    #[test]
    fn main_and_additional_ports() {
        let mut service = corev1::Service::default();
        Service::desired(&full_application(), &mut service).unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(
            Some(&"api".to_string()),
            spec.selector.as_ref().unwrap().get("app")
        );
        let ports = spec.ports.unwrap();
        assert_eq!(2, ports.len());
        assert_eq!(Some("http".to_string()), ports[0].name);
        assert_eq!(8080, ports[0].port);
        assert_eq!(Some(IntOrString::Int(8080)), ports[0].target_port);
        assert_eq!(Some("metrics".to_string()), ports[1].name);
        assert_eq!(Some("TCP".to_string()), ports[1].protocol);
    }

    #[test]
    fn keeps_cluster_ip() {
        let app = application("team-a", "api");
        let mut service = corev1::Service::default();
        Service::desired(&app, &mut service).unwrap();
        let spec = service.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.0.0.12".to_string());
        spec.type_ = Some("ClusterIP".to_string());
        let before = service.clone();
        Service::desired(&app, &mut service).unwrap();
        assert_eq!(before, service);
    }
}
