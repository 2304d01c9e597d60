/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

/// Human readable message of a Kubernetes API error, as recorded in the status of an
/// Application. Conflicts are prefixed with `conflict:` so they are easy to spot.
fn describe(e: &kube::Error) -> String {
    match e {
        kube::Error::Api(r) if r.code == 409 => format!("conflict: {}", r.message),
        kube::Error::Api(r) => r.message.clone(),
        e => e.to_string(),
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The desired state of a dependent object cannot be derived from the Application spec.
    /// Retrying does not help until the Application is changed.
    #[error("invalid application spec: {0}")]
    Validation(String),
    /// The dependent object is already controlled by another owner.
    #[error("{0}")]
    OwnerConflict(String),
    /// The owner reference cannot be built, e.g. as the Application has no UID yet or is
    /// already gone. This is a stale cache and is retried.
    #[error("{0}")]
    UnresolvedOwner(String),
    /// The kind is missing in the kind registry.
    #[error("{0}")]
    UnknownKind(String),
    /// The reconciliation did not finish within its deadline.
    #[error("{0}")]
    Timeout(String),
    /// Kubernetes API error
    #[error("{}", describe(.0))]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::Validation(_) => false,
            ControllerError::OwnerConflict(_) => false,
            ControllerError::UnknownKind(_) => false,
            _ => true,
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            ControllerError::OwnerConflict(_) => true,
            _ => false,
        }
    }
}
