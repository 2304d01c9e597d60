use kube::api::ApiResource;
use serde_json::json;
use skiperator_apis::{Application, ControllerName, ControllerStatus, Phase};
use std::sync::Arc;

use crate::{
    errors::{ControllerError, ExtKubeApiError},
    store::ObjectStore,
    utils::NamespacedName,
};

/// Writes the status entry of a single controller into the status sub-resource of an
/// [`Application`].
///
/// Every write is a JSON merge patch touching only `status.controllers.{controller}`, so
/// controllers never overwrite each other's entries. Writes are best-effort: failures are
/// logged and never replace the outcome of the reconciliation itself.
///
/// A write is skipped if the entry in the given Application snapshot already holds the same
/// phase and reason. Each status write triggers a new watch event for the Application, so
/// skipping redundant writes is what lets the controllers come to rest. Successful writes
/// are applied to the snapshot as well.
#[derive(Clone)]
pub(crate) struct StatusWriter {
    store: Arc<dyn ObjectStore>,
    resource: ApiResource,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn ObjectStore>, resource: ApiResource) -> Self {
        Self { store, resource }
    }

    /// Record that `controller` started to change its dependent object.
    ///
    /// An entry in phase `Error` is kept until the controller has an outcome, otherwise
    /// every retry would flap the entry and re-trigger the reconciliation immediately.
    pub async fn mark_progressing(&self, app: &mut Application, controller: ControllerName) {
        if let Some(Phase::Error) = app.controller_status(controller).map(|s| s.phase) {
            return;
        }
        self.write(app, controller, Phase::Progressing, None).await
    }

    /// Record the outcome of a reconciliation: `phase` on success, `Error` with the error
    /// message as reason otherwise.
    pub async fn mark_outcome(
        &self,
        app: &mut Application,
        controller: ControllerName,
        phase: Phase,
        error: Option<&ControllerError>,
    ) {
        match error {
            Some(e) => self.write(app, controller, Phase::Error, Some(e.to_string())).await,
            None => self.write(app, controller, phase, None).await,
        }
    }

    pub async fn mark_error(
        &self,
        app: &mut Application,
        controller: ControllerName,
        error: &ControllerError,
    ) {
        self.mark_outcome(app, controller, Phase::Error, Some(error))
            .await
    }

    async fn write(
        &self,
        app: &mut Application,
        controller: ControllerName,
        phase: Phase,
        reason: Option<String>,
    ) {
        let current = app.controller_status(controller);
        let entry = match current {
            Some(c) if c.phase == phase && c.reason == reason => {
                trace!(
                    "status of {} for {} is already {}",
                    controller,
                    app.id(),
                    phase.as_str()
                );
                return;
            }
            // The transition time only moves with the phase.
            Some(c) if c.phase == phase => ControllerStatus {
                phase,
                reason,
                last_transition_time: c.last_transition_time.clone(),
            },
            _ => ControllerStatus::new(phase, reason),
        };
        let patch = status_patch(controller, &entry);
        match self
            .store
            .merge_status(&self.resource, &NamespacedName::from(&*app), &patch)
            .await
        {
            Ok(()) => {
                debug!(
                    "status of {} for {} set to {}",
                    controller,
                    app.id(),
                    phase.as_str()
                );
                app.status
                    .get_or_insert_with(Default::default)
                    .controllers
                    .insert(controller.to_string(), entry);
            }
            Err(e) if e.is_not_found() => debug!(
                "Application {} is gone, status of {} not recorded",
                app.id(),
                controller
            ),
            Err(e) => warn!(
                "failed to set status of {} for {} to {}: {}",
                controller,
                app.id(),
                phase.as_str(),
                e
            ),
        }
    }
}

/// Merge patch for a single status entry. A missing reason is sent as `null`, which removes
/// the reason of a previous error.
fn status_patch(controller: ControllerName, entry: &ControllerStatus) -> serde_json::Value {
    json!({
        "status": {
            "controllers": {
                controller.as_str(): {
                    "phase": entry.phase,
                    "reason": entry.reason,
                    "lastTransitionTime": entry.last_transition_time,
                }
            }
        }
    })
}
