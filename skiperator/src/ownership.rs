use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use skiperator_apis::Application;

use crate::errors::ControllerError;

/// Make `owner` the controlling owner of `dependent`, so the garbage collector removes the
/// dependent once the Application is deleted.
///
/// An existing controller reference to the same owner is left untouched. A controller
/// reference to any other owner is never replaced, the dependent belongs to someone else.
pub(crate) fn bind_owner<K: Resource>(
    owner: &Application,
    dependent: &mut K,
) -> Result<(), ControllerError> {
    let owner_ref = owner_reference(owner)?;
    let references = dependent.owner_references_mut();
    if let Some(existing) = references.iter().find(|r| r.controller == Some(true)) {
        if existing.uid == owner_ref.uid {
            return Ok(());
        }
        return Err(ControllerError::OwnerConflict(format!(
            "object is already controlled by {} {} ({}), refusing to take over for {}",
            existing.kind,
            existing.name,
            existing.uid,
            owner.id()
        )));
    }
    // A plain (non-controller) reference to the same owner is upgraded.
    references.retain(|r| r.uid != owner_ref.uid);
    references.push(owner_ref);
    Ok(())
}

fn owner_reference(owner: &Application) -> Result<OwnerReference, ControllerError> {
    if owner.meta().deletion_timestamp.is_some() {
        return Err(ControllerError::UnresolvedOwner(format!(
            "owner {} is being deleted",
            owner.id()
        )));
    }
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::UnresolvedOwner(format!(
            "owner {} has no name or uid yet",
            owner.id()
        ))
    })?;
    Ok(OwnerReference {
        block_owner_deletion: Some(true),
        controller: Some(true),
        ..owner_ref
    })
}
