//! In-memory store.
//!
//! Behaves like the API server where the controller can observe it:
//! optimistic concurrency on `resourceVersion`, spec writes bump
//! `generation`, and status writes only touch the status. Failures can be
//! injected per artifact and for status writes.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Pod, Service, ServiceStatus,
};
use keepalived_api::{GroupKey, KeepalivedGroup, KeepalivedGroupSpec};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    ArtifactStore, ClusterReader, GroupStore, SecretStore, ServiceStatusStore, StoreError,
    StoreResult,
};
use crate::artifact::{Artifact, ArtifactRef};

const GROUP_KIND: &str = "KeepalivedGroup";

#[derive(Default)]
struct State {
    groups: BTreeMap<GroupKey, KeepalivedGroup>,
    services: BTreeMap<(String, String), Service>,
    pods: BTreeMap<(String, String), Pod>,
    secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    artifacts: BTreeMap<ArtifactRef, Value>,
    applied: Vec<ArtifactRef>,
    failing_artifacts: BTreeSet<(String, String)>,
    fail_status_writes: bool,
    fail_next_status_write: bool,
    spec_writes: usize,
    status_writes: usize,
    service_status_writes: usize,
    next_version: u64,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn stored_group(&mut self, group: &KeepalivedGroup) -> StoreResult<&mut KeepalivedGroup> {
        let key = GroupKey::of(group);
        let stored = self.groups.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: GROUP_KIND.to_string(),
            name: key.to_string(),
        })?;

        if stored.metadata.resource_version != group.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: GROUP_KIND.to_string(),
                name: key.to_string(),
                message: format!(
                    "resourceVersion {} is stale, current is {}",
                    group.metadata.resource_version.as_deref().unwrap_or_default(),
                    stored.metadata.resource_version.as_deref().unwrap_or_default()
                ),
            });
        }
        Ok(stored)
    }
}

fn object_key(namespace: Option<&str>, name: Option<&str>) -> (String, String) {
    (
        namespace.unwrap_or_default().to_string(),
        name.unwrap_or_default().to_string(),
    )
}

/// Store holding everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Create or replace a group the way a user would: a uid is assigned if
    /// missing, the generation starts at 1, and a fresh resourceVersion is set.
    pub async fn insert_group(&self, mut group: KeepalivedGroup) -> KeepalivedGroup {
        let mut state = self.state.write().await;
        if group.metadata.uid.is_none() {
            group.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        group.metadata.generation = Some(group.metadata.generation.unwrap_or(1));
        group.metadata.resource_version = Some(state.bump_version());
        state.groups.insert(GroupKey::of(&group), group.clone());
        group
    }

    /// Edit a group's spec out of band, bumping generation and resourceVersion.
    pub async fn edit_group<F>(&self, key: &GroupKey, edit: F) -> Option<KeepalivedGroup>
    where
        F: FnOnce(&mut KeepalivedGroupSpec),
    {
        let mut state = self.state.write().await;
        let version = state.bump_version();
        let group = state.groups.get_mut(key)?;
        edit(&mut group.spec);
        group.metadata.generation = Some(group.metadata.generation.unwrap_or(0) + 1);
        group.metadata.resource_version = Some(version);
        Some(group.clone())
    }

    pub async fn group(&self, key: &GroupKey) -> Option<KeepalivedGroup> {
        self.state.read().await.groups.get(key).cloned()
    }

    pub async fn upsert_service(&self, service: Service) {
        let key = object_key(
            service.metadata.namespace.as_deref(),
            service.metadata.name.as_deref(),
        );
        self.state.write().await.services.insert(key, service);
    }

    pub async fn remove_service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .write()
            .await
            .services
            .remove(&object_key(Some(namespace), Some(name)))
    }

    pub async fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .read()
            .await
            .services
            .get(&object_key(Some(namespace), Some(name)))
            .cloned()
    }

    pub async fn upsert_pod(&self, pod: Pod) {
        let key = object_key(pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref());
        self.state.write().await.pods.insert(key, pod);
    }

    pub async fn insert_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.state
            .write()
            .await
            .secrets
            .insert(object_key(Some(namespace), Some(name)), data);
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make applying the artifact with this kind and name fail.
    pub async fn fail_apply(&self, kind: &str, name: &str) {
        self.state
            .write()
            .await
            .failing_artifacts
            .insert((kind.to_string(), name.to_string()));
    }

    /// Make every status write fail.
    pub async fn fail_status_writes(&self, fail: bool) {
        self.state.write().await.fail_status_writes = fail;
    }

    /// Make only the next status write fail.
    pub async fn fail_next_status_write(&self) {
        self.state.write().await.fail_next_status_write = true;
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.failing_artifacts.clear();
        state.fail_status_writes = false;
        state.fail_next_status_write = false;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn artifact(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .read()
            .await
            .artifacts
            .iter()
            .find(|(r, _)| r.kind == kind && r.namespace == namespace && r.name == name)
            .map(|(_, v)| v.clone())
    }

    pub async fn artifact_count(&self) -> usize {
        self.state.read().await.artifacts.len()
    }

    /// Every apply call that succeeded, in order.
    pub async fn applied(&self) -> Vec<ArtifactRef> {
        self.state.read().await.applied.clone()
    }

    pub async fn spec_writes(&self) -> usize {
        self.state.read().await.spec_writes
    }

    pub async fn status_writes(&self) -> usize {
        self.state.read().await.status_writes
    }

    pub async fn service_status_writes(&self) -> usize {
        self.state.read().await.service_status_writes
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn get_group(&self, key: &GroupKey) -> StoreResult<Option<KeepalivedGroup>> {
        Ok(self.state.read().await.groups.get(key).cloned())
    }

    async fn update_group(&self, group: &KeepalivedGroup) -> StoreResult<KeepalivedGroup> {
        let mut state = self.state.write().await;
        let version = state.bump_version();
        let stored = state.stored_group(group)?;

        if stored.spec != group.spec {
            stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
        }
        stored.spec = group.spec.clone();
        stored.metadata.labels = group.metadata.labels.clone();
        stored.metadata.annotations = group.metadata.annotations.clone();
        stored.metadata.finalizers = group.metadata.finalizers.clone();
        stored.metadata.resource_version = Some(version);

        let updated = stored.clone();
        state.spec_writes += 1;
        debug!(group = %GroupKey::of(&updated), "Stored group spec");
        Ok(updated)
    }

    async fn update_group_status(&self, group: &KeepalivedGroup) -> StoreResult<KeepalivedGroup> {
        let mut state = self.state.write().await;
        if state.fail_status_writes || std::mem::take(&mut state.fail_next_status_write) {
            return Err(StoreError::Backend(format!(
                "status writes disabled for {}",
                GroupKey::of(group)
            )));
        }

        let version = state.bump_version();
        let stored = state.stored_group(group)?;
        stored.status = group.status.clone();
        stored.metadata.resource_version = Some(version);

        let updated = stored.clone();
        state.status_writes += 1;
        debug!(group = %GroupKey::of(&updated), "Stored group status");
        Ok(updated)
    }
}

#[async_trait]
impl ClusterReader for MemoryStore {
    async fn list_services(&self) -> StoreResult<Vec<Service>> {
        Ok(self.state.read().await.services.values().cloned().collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<Pod>> {
        let state = self.state.read().await;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, pod)| {
                let pod_labels = pod.metadata.labels.as_ref();
                labels
                    .iter()
                    .all(|(k, v)| pod_labels.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }
}

#[async_trait]
impl ServiceStatusStore for MemoryStore {
    async fn update_service_ingress(
        &self,
        namespace: &str,
        name: &str,
        ips: &[String],
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .get_mut(&object_key(Some(namespace), Some(name)))
            .ok_or_else(|| StoreError::NotFound {
                kind: "Service".to_string(),
                name: format!("{namespace}/{name}"),
            })?;

        let ingress = ips
            .iter()
            .map(|ip| LoadBalancerIngress {
                ip: Some(ip.clone()),
                ..Default::default()
            })
            .collect();
        let status = service.status.get_or_insert_with(ServiceStatus::default);
        status.load_balancer = Some(LoadBalancerStatus {
            ingress: Some(ingress),
        });
        state.service_status_writes += 1;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(self
            .state
            .read()
            .await
            .secrets
            .get(&object_key(Some(namespace), Some(name)))
            .cloned())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn apply(&self, artifact: &Artifact) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let reference = artifact.reference();

        if state
            .failing_artifacts
            .contains(&(reference.kind.clone(), reference.name.clone()))
        {
            return Err(StoreError::Backend(format!("injected failure applying {reference}")));
        }

        state.artifacts.insert(reference.clone(), artifact.as_value().clone());
        state.applied.push(reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn group(name: &str) -> KeepalivedGroup {
        let mut group = KeepalivedGroup::new(
            name,
            KeepalivedGroupSpec {
                interface: "eno1".to_string(),
                ..Default::default()
            },
        );
        group.metadata.namespace = Some("keepalived".to_string());
        group
    }

    #[tokio::test]
    async fn test_insert_assigns_identity() {
        let store = MemoryStore::new();
        let stored = store.insert_group(group("vip")).await;

        assert!(stored.metadata.uid.is_some());
        assert_eq!(stored.metadata.generation, Some(1));
        assert!(stored.metadata.resource_version.is_some());
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let store = MemoryStore::new();
        let stored = store.insert_group(group("vip")).await;
        let key = GroupKey::of(&stored);

        store
            .edit_group(&key, |spec| spec.image = "example.com/keepalived".to_string())
            .await
            .unwrap();

        let err = store.update_group_status(&stored).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_writes().await, 0);
    }

    #[tokio::test]
    async fn test_spec_write_bumps_generation_only_on_change() {
        let store = MemoryStore::new();
        let stored = store.insert_group(group("vip")).await;

        let same = store.update_group(&stored).await.unwrap();
        assert_eq!(same.metadata.generation, Some(1));

        let mut changed = same.clone();
        changed.spec.image = "example.com/keepalived".to_string();
        let changed = store.update_group(&changed).await.unwrap();
        assert_eq!(changed.metadata.generation, Some(2));
        assert_ne!(changed.metadata.resource_version, same.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_status_write_keeps_spec() {
        let store = MemoryStore::new();
        let stored = store.insert_group(group("vip")).await;

        let mut update = stored.clone();
        update.spec.image = "ignored".to_string();
        update.status_mut().router_ids.insert("ns/svc".to_string(), 1);
        let updated = store.update_group_status(&update).await.unwrap();

        assert_eq!(updated.spec.image, "");
        assert_eq!(updated.router_ids().get("ns/svc"), Some(&1));
    }

    #[tokio::test]
    async fn test_list_pods_filters_namespace_and_labels() {
        let store = MemoryStore::new();
        for (ns, name, label) in [
            ("keepalived", "a", Some("vip")),
            ("keepalived", "b", Some("other")),
            ("keepalived", "c", None),
            ("default", "d", Some("vip")),
        ] {
            store
                .upsert_pod(Pod {
                    metadata: ObjectMeta {
                        namespace: Some(ns.to_string()),
                        name: Some(name.to_string()),
                        labels: label.map(|l| {
                            BTreeMap::from([("keepalivedGroup".to_string(), l.to_string())])
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .await;
        }

        let labels = BTreeMap::from([("keepalivedGroup".to_string(), "vip".to_string())]);
        let pods = store.list_pods("keepalived", &labels).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_service_ingress_write() {
        let store = MemoryStore::new();
        let err = store
            .update_service_ingress("ns", "web", &["10.0.0.1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        store
            .upsert_service(Service {
                metadata: ObjectMeta {
                    namespace: Some("ns".to_string()),
                    name: Some("web".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
        store
            .update_service_ingress("ns", "web", &["10.0.0.1".to_string()])
            .await
            .unwrap();

        let service = store.service("ns", "web").await.unwrap();
        let ingress = service.status.unwrap().load_balancer.unwrap().ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(store.service_status_writes().await, 1);
    }
}
