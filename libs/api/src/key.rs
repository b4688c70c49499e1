//! Group identity.

use std::fmt;
use std::str::FromStr;

use kube::ResourceExt;

use crate::{KeepalivedGroup, ReferenceError};

/// `namespace/name` identity of a [`KeepalivedGroup`].
///
/// This is the unit the trigger layer queues and the controller reconciles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub namespace: String,
    pub name: String,
}

impl GroupKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing group object. Cluster-scoped copies (which the API
    /// server never produces for this namespaced kind) map to an empty namespace.
    pub fn of(group: &KeepalivedGroup) -> Self {
        Self {
            namespace: group.namespace().unwrap_or_default(),
            name: group.name_any(),
        }
    }

    /// Parses a reference in the `namespace/name` form used by the service
    /// annotation.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let elements: Vec<&str> = s.split('/').collect();
        match elements.as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(*namespace, *name))
            }
            _ => Err(ReferenceError::InvalidFormat(s.to_string())),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for GroupKey {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for GroupKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for GroupKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
