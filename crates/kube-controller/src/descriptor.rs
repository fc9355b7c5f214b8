//! Resource descriptor.
//!
//! Immutable identity of the watched resource type: group, version, plural
//! and singular names, the namespace it is watched in and the
//! reconciliation interval.

use crate::error::ControllerError;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::time::Duration;

/// Reconciliation interval used when none is configured.
pub const DEFAULT_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(5);

/// Identity of a watched custom resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    group: String,
    version: String,
    plural: String,
    singular: String,
    namespace: String,
    reconciliation_interval: Duration,
}

impl ResourceDescriptor {
    /// Creates a descriptor with the default reconciliation interval.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidDescriptor`] when any field is blank.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        plural: impl Into<String>,
        singular: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, ControllerError> {
        Ok(Self {
            group: required("group", group.into())?,
            version: required("version", version.into())?,
            plural: required("plural", plural.into())?,
            singular: required("singular", singular.into())?,
            namespace: required("namespace", namespace.into())?,
            reconciliation_interval: DEFAULT_RECONCILIATION_INTERVAL,
        })
    }

    /// Replaces the reconciliation interval.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidDescriptor`] for a zero interval.
    pub fn with_reconciliation_interval(mut self, interval: Duration) -> Result<Self, ControllerError> {
        if interval.is_zero() {
            return Err(ControllerError::InvalidDescriptor(
                "reconciliation interval must be greater than zero".to_string(),
            ));
        }
        self.reconciliation_interval = interval;
        Ok(self)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn plural(&self) -> &str {
        &self.plural
    }

    pub fn singular(&self) -> &str {
        &self.singular
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn reconciliation_interval(&self) -> Duration {
        self.reconciliation_interval
    }

    /// `group/version`, as used in `apiVersion`.
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    /// `plural.group/version`, used in every diagnostic.
    pub fn display_name(&self) -> String {
        format!("{}.{}/{}", self.plural, self.group, self.version)
    }

    /// Annotation key holding a resource's status: `group/singular-status`.
    pub fn status_annotation_name(&self) -> String {
        format!("{}/{}-status", self.group, self.singular)
    }

    /// Reads the status annotation of a resource, if present.
    pub fn status_of<'a, K: Resource>(&self, resource: &'a K) -> Option<&'a str> {
        resource
            .annotations()
            .get(&self.status_annotation_name())
            .map(String::as_str)
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn required(field: &str, value: String) -> Result<String, ControllerError> {
    if value.trim().is_empty() {
        Err(ControllerError::InvalidDescriptor(format!("{field} must not be blank")))
    } else {
        Ok(value)
    }
}
