use kube::{ResourceExt, api::DynamicObject};
use serde::{Serialize, de::DeserializeOwned};
use skiperator_apis::{Application, MANAGED_BY_LABEL};
use std::collections::BTreeMap;

use crate::{MANAGER, errors::ControllerError};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&DynamicObject> for NamespacedName {
    fn from(o: &DynamicObject) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_else(|| "".to_string()),
        }
    }
}

impl From<&Application> for NamespacedName {
    fn from(o: &Application) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_else(|| "".to_string()),
        }
    }
}

/// Convert a typed object into its untyped representation used by the backing store.
pub(crate) fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, ControllerError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Convert an untyped object of the backing store into its typed representation.
pub(crate) fn from_dynamic<K: DeserializeOwned>(
    object: &DynamicObject,
) -> Result<K, ControllerError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Labels put on every dependent object of an Application.
pub(crate) fn dependent_labels(app: &Application) -> BTreeMap<String, String> {
    let mut labels = app.selector_labels();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    labels
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("skiperator_{}", name)
}
