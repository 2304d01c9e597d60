use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use kube::ResourceExt;
use skiperator_apis::{Application, ControllerName};

use super::DependentResource;
use crate::errors::ControllerError;

/// Scales the Deployment of the application on CPU utilization.
pub(crate) struct Autoscaler;

impl DependentResource for Autoscaler {
    type Object = HorizontalPodAutoscaler;

    const CONTROLLER: ControllerName = ControllerName::Autoscaler;

    fn desired(
        app: &Application,
        hpa: &mut HorizontalPodAutoscaler,
    ) -> Result<(), ControllerError> {
        let replicas = &app.spec.replicas;
        if replicas.min < 1 || replicas.min > replicas.max {
            return Err(ControllerError::validation(format!(
                "replicas min {} and max {} must satisfy 1 <= min <= max",
                replicas.min, replicas.max
            )));
        }
        if !(1..=100).contains(&replicas.target_cpu_utilization) {
            return Err(ControllerError::validation(format!(
                "target CPU utilization {} is out of range 1-100",
                replicas.target_cpu_utilization
            )));
        }
        let spec = hpa.spec.get_or_insert_with(Default::default);
        spec.scale_target_ref = CrossVersionObjectReference {
            api_version: Some("apps/v1".to_string()),
            kind: "Deployment".to_string(),
            name: app.name_any(),
        };
        spec.min_replicas = Some(replicas.min);
        spec.max_replicas = replicas.max;
        spec.metrics = Some(vec![MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: "cpu".to_string(),
                target: MetricTarget {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(replicas.target_cpu_utilization),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }]);
        Ok(())
    }
}
