//! Rendered objects pushed to the backing store.

use std::fmt;

use keepalived_api::KeepalivedGroup;
use kube::{Resource, ResourceExt};
use serde_json::Value;

use crate::render::RenderError;

/// Identity of an artifact: group/version, kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// One object produced by the template, as untyped JSON.
///
/// Construction guarantees `apiVersion`, `kind` and `metadata.name` are
/// non-empty strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    object: Value,
}

fn string_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, segment| v.get(*segment))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

impl Artifact {
    pub fn from_value(object: Value) -> Result<Self, RenderError> {
        if !object.is_object() {
            return Err(RenderError::InvalidArtifact(format!(
                "expected an object, got {object}"
            )));
        }
        for path in [&["apiVersion"][..], &["kind"], &["metadata", "name"]] {
            if string_at(&object, path).is_none() {
                return Err(RenderError::InvalidArtifact(format!(
                    "missing {} in {object}",
                    path.join(".")
                )));
            }
        }
        Ok(Self { object })
    }

    pub fn api_version(&self) -> &str {
        string_at(&self.object, &["apiVersion"]).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        string_at(&self.object, &["kind"]).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        string_at(&self.object, &["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        string_at(&self.object, &["metadata", "namespace"])
    }

    /// API group and version, e.g. `("apps", "v1")` or `("", "v1")`.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version().split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version()),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.object
    }

    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().unwrap_or_default().to_string(),
            name: self.name().to_string(),
        }
    }

    /// Place the artifact in the group's namespace unless it names its own,
    /// and make the group its controlling owner when both share a namespace.
    pub fn adopt(&mut self, owner: &KeepalivedGroup) {
        let namespace = owner.namespace().unwrap_or_default();
        let owner_ref = owner.controller_owner_ref(&());

        let Some(metadata) = self.object.get_mut("metadata").and_then(Value::as_object_mut) else {
            return;
        };

        let own_namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);

        let artifact_namespace = match own_namespace {
            Some(ns) => ns,
            None => {
                metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
                namespace.clone()
            }
        };

        let Some(owner_ref) = owner_ref else {
            return;
        };
        if artifact_namespace != namespace {
            return;
        }

        let Ok(owner_value) = serde_json::to_value(&owner_ref) else {
            return;
        };

        let references = metadata
            .entry("ownerReferences")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(references) = references.as_array_mut() {
            let already_owned = references
                .iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(owner_ref.uid.as_str()));
            if !already_owned {
                references.push(owner_value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keepalived_api::KeepalivedGroupSpec;
    use serde_json::json;

    use super::*;

    fn group(uid: Option<&str>) -> KeepalivedGroup {
        let mut group = KeepalivedGroup::new(
            "vip",
            KeepalivedGroupSpec {
                interface: "eno1".to_string(),
                ..Default::default()
            },
        );
        group.metadata.namespace = Some("keepalived".to_string());
        group.metadata.uid = uid.map(str::to_string);
        group
    }

    #[test]
    fn test_from_value_requires_identity() {
        assert!(Artifact::from_value(json!({"kind": "ConfigMap", "metadata": {"name": "a"}})).is_err());
        assert!(Artifact::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap"})).is_err());
        assert!(Artifact::from_value(json!("ConfigMap")).is_err());

        let artifact = Artifact::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": "vip"}
        }))
        .unwrap();
        assert_eq!(artifact.group_version(), ("apps", "v1"));
        assert_eq!(artifact.namespace(), None);
    }

    #[test]
    fn test_core_group_version() {
        let artifact = Artifact::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "vip"}
        }))
        .unwrap();
        assert_eq!(artifact.group_version(), ("", "v1"));
    }

    #[test]
    fn test_adopt_sets_namespace_and_owner() {
        let mut artifact = Artifact::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "vip"}
        }))
        .unwrap();

        artifact.adopt(&group(Some("1234")));
        artifact.adopt(&group(Some("1234")));

        assert_eq!(artifact.namespace(), Some("keepalived"));
        let owners = artifact.as_value()["metadata"]["ownerReferences"]
            .as_array()
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0]["kind"], "KeepalivedGroup");
        assert_eq!(owners[0]["controller"], true);
        assert_eq!(
            artifact.reference().to_string(),
            "ConfigMap keepalived/vip"
        );
    }

    #[test]
    fn test_adopt_keeps_foreign_namespace_unowned() {
        let mut artifact = Artifact::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "vip", "namespace": "elsewhere"}
        }))
        .unwrap();

        artifact.adopt(&group(Some("1234")));

        assert_eq!(artifact.namespace(), Some("elsewhere"));
        assert!(artifact.as_value()["metadata"].get("ownerReferences").is_none());
    }

    #[test]
    fn test_adopt_without_uid_only_sets_namespace() {
        let mut artifact = Artifact::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "vip"}
        }))
        .unwrap();

        artifact.adopt(&group(None));

        assert_eq!(artifact.namespace(), Some("keepalived"));
        assert!(artifact.as_value()["metadata"].get("ownerReferences").is_none());
    }
}
