//! Backing store interfaces.
//!
//! The controller only talks to the cluster through these traits:
//! - [`GroupStore`]: read and write `KeepalivedGroup` objects
//! - [`ClusterReader`]: list services and keepalived pods
//! - [`ServiceStatusStore`]: publish load balancer ingress on services
//! - [`SecretStore`]: read secret data for password authentication
//! - [`ArtifactStore`]: create or update rendered objects
//!
//! [`cluster::KubeStore`] implements them against the API server,
//! [`memory::MemoryStore`] in memory for tests and local runs.

pub mod cluster;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use keepalived_api::{GroupKey, KeepalivedGroup};
use thiserror::Error;

use crate::artifact::Artifact;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Write raced with another writer (stale resourceVersion).
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Anything else the backend reported.
    #[error("backing store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Access to `KeepalivedGroup` objects.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Fetch a group. `None` when it does not exist.
    async fn get_group(&self, key: &GroupKey) -> StoreResult<Option<KeepalivedGroup>>;

    /// Write metadata and spec. Returns the stored object.
    async fn update_group(&self, group: &KeepalivedGroup) -> StoreResult<KeepalivedGroup>;

    /// Write the status subresource. Returns the stored object.
    async fn update_group_status(&self, group: &KeepalivedGroup) -> StoreResult<KeepalivedGroup>;
}

/// Read-only access to the objects that feed membership and rendering.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Every service in every namespace.
    async fn list_services(&self) -> StoreResult<Vec<Service>>;

    /// Pods in `namespace` carrying all of `labels`.
    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<Pod>>;
}

/// Writes to the status of member services.
#[async_trait]
pub trait ServiceStatusStore: Send + Sync {
    /// Replace `status.loadBalancer.ingress` of a service with `ips`.
    async fn update_service_ingress(
        &self,
        namespace: &str,
        name: &str,
        ips: &[String],
    ) -> StoreResult<()>;
}

/// Access to secret data.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Decoded data of a secret. `None` when it does not exist.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>>;
}

/// Create-or-update of rendered objects.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Make the stored object match `artifact` for every field it sets.
    async fn apply(&self, artifact: &Artifact) -> StoreResult<()>;
}

/// Everything the controller needs.
pub trait Store:
    GroupStore + ClusterReader + ServiceStatusStore + SecretStore + ArtifactStore
{
}

impl<T> Store for T where
    T: GroupStore + ClusterReader + ServiceStatusStore + SecretStore + ArtifactStore
{
}

/// Label selector string (`k1=v1,k2=v2`) for a label map.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        assert_eq!(label_selector(&labels), "");
        labels.insert("keepalivedGroup".to_string(), "vip".to_string());
        labels.insert("app".to_string(), "keepalived".to_string());
        assert_eq!(label_selector(&labels), "app=keepalived,keepalivedGroup=vip");
    }
}
