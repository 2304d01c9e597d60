use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::ResourceExt;
use skiperator_apis::{Application, ControllerName};

use super::{DependentResource, validate_port};
use crate::errors::ControllerError;

/// The Deployment running the application container.
///
/// The replica count is left to the autoscaler, so it is never set here.
pub(crate) struct Workload;

impl DependentResource for Workload {
    type Object = Deployment;

    const CONTROLLER: ControllerName = ControllerName::Workload;

    fn desired(app: &Application, deployment: &mut Deployment) -> Result<(), ControllerError> {
        let ports = container_ports(app)?;
        let labels = app.selector_labels();
        let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);
        spec.selector = LabelSelector {
            match_labels: Some(labels.clone()),
            match_expressions: None,
        };
        let template: &mut PodTemplateSpec = &mut spec.template;
        template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
        let pod = template.spec.get_or_insert_with(PodSpec::default);
        let name = app.name_any();
        let container = match pod.containers.iter().position(|c| c.name == name) {
            Some(idx) => &mut pod.containers[idx],
            None => {
                pod.containers.push(Container {
                    name,
                    ..Default::default()
                });
                let last = pod.containers.len() - 1;
                &mut pod.containers[last]
            }
        };
        container.image = Some(app.spec.image.clone());
        container.command = if app.spec.command.is_empty() {
            None
        } else {
            Some(app.spec.command.clone())
        };
        container.env = if app.spec.env.is_empty() {
            None
        } else {
            Some(
                app.spec
                    .env
                    .iter()
                    .map(|e| EnvVar {
                        name: e.name.clone(),
                        value: Some(e.value.clone()).filter(|v| !v.is_empty()),
                        ..Default::default()
                    })
                    .collect(),
            )
        };
        container.ports = Some(ports);
        Ok(())
    }
}

fn container_ports(app: &Application) -> Result<Vec<ContainerPort>, ControllerError> {
    let mut ports = vec![ContainerPort {
        name: Some("main".to_string()),
        container_port: validate_port("port", app.spec.port)?,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    for p in app.spec.additional_ports.iter() {
        ports.push(ContainerPort {
            name: Some(p.name.clone()),
            container_port: validate_port(&format!("additional port {}", p.name), p.port)?,
            protocol: Some(p.protocol.as_str().to_string()),
            ..Default::default()
        });
    }
    Ok(ports)
}
