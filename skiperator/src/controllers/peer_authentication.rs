use skiperator_apis::{
    Application, ControllerName,
    istio::{self, MutualTls, MutualTlsMode, WorkloadSelector},
};

use super::DependentResource;
use crate::errors::ControllerError;

/// Requires mutual TLS for all traffic to the application pods.
pub(crate) struct PeerAuthentication;

impl DependentResource for PeerAuthentication {
    type Object = istio::PeerAuthentication;

    const CONTROLLER: ControllerName = ControllerName::PeerAuthentication;

    fn desired(
        app: &Application,
        peer_authentication: &mut istio::PeerAuthentication,
    ) -> Result<(), ControllerError> {
        peer_authentication.spec.selector = Some(WorkloadSelector::new(app.selector_labels()));
        peer_authentication.spec.mtls = Some(MutualTls {
            mode: MutualTlsMode::Strict,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::application;

    #[test]
    fn strict_mtls_for_application_pods() {
        let mut pa = istio::PeerAuthentication::default();
        PeerAuthentication::desired(&application("team-a", "api"), &mut pa).unwrap();
        let spec = pa.spec;
        assert_eq!(
            Some(&"api".to_string()),
            spec.selector.unwrap().match_labels.get("app")
        );
        assert_eq!(MutualTlsMode::Strict, spec.mtls.unwrap().mode);
    }

    #[test]
    fn restores_strict_mode() {
        let app = application("team-a", "api");
        let mut pa = istio::PeerAuthentication::default();
        PeerAuthentication::desired(&app, &mut pa).unwrap();
        pa.spec.mtls = Some(MutualTls {
            mode: MutualTlsMode::Permissive,
        });
        PeerAuthentication::desired(&app, &mut pa).unwrap();
        assert_eq!(MutualTlsMode::Strict, pa.spec.mtls.unwrap().mode);
    }
}
