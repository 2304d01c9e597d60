use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod istio;

pub const API_GROUP: &'static str = "skiperator.kartverket.no";

/// Label put on every dependent object managed by the operator.
pub const MANAGED_BY_LABEL: &'static str = "app.kubernetes.io/managed-by";

/// Names of the controllers reconciling an [`Application`], one per dependent resource.
///
/// The name is used as key of the controller's entry in [`ApplicationStatus::controllers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControllerName {
    Workload,
    Autoscaler,
    NetworkPolicy,
    Service,
    Sidecar,
    PeerAuthentication,
    IngressGateway,
    IngressRoute,
    EgressServiceEntry,
    EgressGateway,
    EgressRoute,
}

impl ControllerName {
    pub const ALL: [ControllerName; 11] = [
        ControllerName::Workload,
        ControllerName::Autoscaler,
        ControllerName::NetworkPolicy,
        ControllerName::Service,
        ControllerName::Sidecar,
        ControllerName::PeerAuthentication,
        ControllerName::IngressGateway,
        ControllerName::IngressRoute,
        ControllerName::EgressServiceEntry,
        ControllerName::EgressGateway,
        ControllerName::EgressRoute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerName::Workload => "Workload",
            ControllerName::Autoscaler => "Autoscaler",
            ControllerName::NetworkPolicy => "NetworkPolicy",
            ControllerName::Service => "Service",
            ControllerName::Sidecar => "Sidecar",
            ControllerName::PeerAuthentication => "PeerAuthentication",
            ControllerName::IngressGateway => "IngressGateway",
            ControllerName::IngressRoute => "IngressRoute",
            ControllerName::EgressServiceEntry => "EgressServiceEntry",
            ControllerName::EgressGateway => "EgressGateway",
            ControllerName::EgressRoute => "EgressRoute",
        }
    }
}

impl std::fmt::Display for ControllerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application is the high-level description of a deployable workload. The operator
/// derives the Deployment, autoscaler, network policy, service and Istio resources
/// from it.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "skiperator.kartverket.no",
    version = "v1alpha1",
    kind = "Application",
    derive = "PartialEq",
    status = "ApplicationStatus",
    namespaced,
    shortname = "app",
    printcolumn = r#"{
        "name":"Image",
        "type": "string",
        "jsonPath": ".spec.image"
    }"#,
    printcolumn = r#"{
        "name":"Age",
        "type": "date",
        "jsonPath": ".metadata.creationTimestamp"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// The container image to run.
    pub image: String,
    /// Overrides the entrypoint of the container image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// The main port the application listens on, exposed as `http` by the Service.
    pub port: i32,
    /// Further ports exposed by the container and the Service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_ports: Vec<InternalPort>,
    /// Environment variables passed to the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Scaling bounds for the horizontal pod autoscaler.
    #[serde(default)]
    pub replicas: Replicas,
    /// Hostnames exposed through the ingress gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<String>,
    /// Which applications may talk to this application and where it may talk to.
    #[serde(default)]
    pub access_policy: AccessPolicy,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "SCTP")]
    Sctp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Tcp
    }
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

/// A named port inside the cluster.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct InternalPort {
    pub name: String,
    pub port: i32,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Replicas {
    #[serde(default = "Replicas::default_min")]
    pub min: i32,
    #[serde(default = "Replicas::default_max")]
    pub max: i32,
    /// Average CPU utilization in percent the autoscaler aims for.
    #[serde(default = "Replicas::default_target_cpu_utilization")]
    pub target_cpu_utilization: i32,
}

impl Replicas {
    fn default_min() -> i32 {
        2
    }

    fn default_max() -> i32 {
        5
    }

    fn default_target_cpu_utilization() -> i32 {
        80
    }
}

impl Default for Replicas {
    fn default() -> Self {
        Self {
            min: Self::default_min(),
            max: Self::default_max(),
            target_cpu_utilization: Self::default_target_cpu_utilization(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
pub struct AccessPolicy {
    #[serde(default)]
    pub inbound: InboundPolicy,
    #[serde(default)]
    pub outbound: OutboundPolicy,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
pub struct InboundPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<InternalRule>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
pub struct OutboundPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<InternalRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external: Vec<ExternalRule>,
}

/// Reference to another application in the cluster.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct InternalRule {
    /// The namespace of the other application, defaults to the namespace of this application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub application: String,
}

impl InternalRule {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// Host outside the cluster this application may reach through the egress gateway.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct ExternalRule {
    pub host: String,
    /// Ports of the external host, defaults to `https` on port 443.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ExternalPort>,
}

impl ExternalRule {
    pub fn ports(&self) -> Vec<ExternalPort> {
        if self.ports.is_empty() {
            vec![ExternalPort::default()]
        } else {
            self.ports.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct ExternalPort {
    pub name: String,
    pub port: i32,
    /// Istio port protocol, e.g. `HTTPS`, `TLS`, `HTTP` or `TCP`.
    pub protocol: String,
}

impl Default for ExternalPort {
    fn default() -> Self {
        Self {
            name: "https".to_string(),
            port: 443,
            protocol: "TLS".to_string(),
        }
    }
}

/// Reconciliation phase of a single controller.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Progressing,
    Synced,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Progressing => "Progressing",
            Phase::Synced => "Synced",
            Phase::Error => "Error",
        }
    }
}

/// Status entry written exclusively by the controller it is keyed by.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub phase: Phase,
    /// Error message, only set if `phase` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Time the phase last changed, RFC 3339 with seconds precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl ControllerStatus {
    pub fn new(phase: Phase, reason: Option<String>) -> Self {
        Self {
            phase,
            reason,
            last_transition_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

/// The status sub-resource of an [`Application`].
///
/// Every controller owns exactly one entry in `controllers` and only ever merge-patches that
/// entry, the map as a whole is never replaced.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct ApplicationStatus {
    #[serde(default)]
    pub controllers: BTreeMap<String, ControllerStatus>,
}

impl ApplicationStatus {
    pub fn controller(&self, name: ControllerName) -> Option<&ControllerStatus> {
        self.controllers.get(name.as_str())
    }

    /// An application is ready once every controller reports `Synced`.
    pub fn is_ready(&self) -> bool {
        self.summary() == Phase::Synced
    }

    /// Aggregated phase: `Error` if any controller failed, `Progressing` while any
    /// controller has not yet reported or is still progressing, `Synced` otherwise.
    pub fn summary(&self) -> Phase {
        let phases: Vec<Option<Phase>> = ControllerName::ALL
            .iter()
            .map(|c| self.controller(*c).map(|s| s.phase))
            .collect();
        if phases.contains(&Some(Phase::Error)) {
            Phase::Error
        } else if phases.iter().all(|p| p == &Some(Phase::Synced)) {
            Phase::Synced
        } else {
            Phase::Progressing
        }
    }
}

impl Application {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn controller_status(&self, name: ControllerName) -> Option<&ControllerStatus> {
        self.status.as_ref().map(|s| s.controller(name)).flatten()
    }

    /// Labels identifying the pods of this application, `app: {name}`.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app".to_string(),
            self.metadata.name.clone().unwrap_or_default(),
        );
        labels
    }
}
