//! Store backed by the Kubernetes API server.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use keepalived_api::{GroupKey, KeepalivedGroup};
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{
    label_selector, ArtifactStore, ClusterReader, GroupStore, SecretStore, ServiceStatusStore,
    StoreError, StoreResult,
};
use crate::artifact::Artifact;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "keepalived-operator";

pub const POD_MONITOR_API_VERSION: &str = "monitoring.coreos.com/v1";
pub const POD_MONITOR_KIND: &str = "PodMonitor";

const GROUP_KIND: &str = "KeepalivedGroup";

fn store_error(err: kube::Error, kind: &str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: response.message,
        },
        other => StoreError::Backend(other.to_string()),
    }
}

/// Store talking to the API server through a shared client.
pub struct KubeStore {
    client: Client,

    /// Discovery results per kind, resolved on first use.
    resources: RwLock<HashMap<GroupVersionKind, (ApiResource, Scope)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: RwLock::new(HashMap::new()),
        }
    }

    fn groups(&self, namespace: &str) -> Api<KeepalivedGroup> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> StoreResult<(ApiResource, Scope)> {
        if let Some(found) = self.resources.read().await.get(gvk) {
            return Ok(found.clone());
        }

        let (resource, capabilities) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| store_error(e, &gvk.kind, "discovery"))?;
        debug!(
            group = %gvk.group,
            version = %gvk.version,
            kind = %gvk.kind,
            plural = %resource.plural,
            "Resolved resource"
        );

        let resolved = (resource, capabilities.scope);
        self.resources
            .write()
            .await
            .insert(gvk.clone(), resolved.clone());
        Ok(resolved)
    }
}

#[async_trait]
impl GroupStore for KubeStore {
    async fn get_group(&self, key: &GroupKey) -> StoreResult<Option<KeepalivedGroup>> {
        self.groups(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| store_error(e, GROUP_KIND, &key.to_string()))
    }

    async fn update_group(&self, group: &KeepalivedGroup) -> StoreResult<KeepalivedGroup> {
        let key = GroupKey::of(group);
        self.groups(&key.namespace)
            .replace(&key.name, &PostParams::default(), group)
            .await
            .map_err(|e| store_error(e, GROUP_KIND, &key.to_string()))
    }

    async fn update_group_status(&self, group: &KeepalivedGroup) -> StoreResult<KeepalivedGroup> {
        let key = GroupKey::of(group);
        let body = serde_json::to_vec(group).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.groups(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| store_error(e, GROUP_KIND, &key.to_string()))
    }
}

#[async_trait]
impl ClusterReader for KubeStore {
    async fn list_services(&self) -> StoreResult<Vec<Service>> {
        let services: Api<Service> = Api::all(self.client.clone());
        services
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| store_error(e, "Service", "*"))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.list(&ListParams::default().labels(&label_selector(labels)))
            .await
            .map(|list| list.items)
            .map_err(|e| store_error(e, "Pod", namespace))
    }
}

#[async_trait]
impl ServiceStatusStore for KubeStore {
    async fn update_service_ingress(
        &self,
        namespace: &str,
        name: &str,
        ips: &[String],
    ) -> StoreResult<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let ingress: Vec<_> = ips.iter().map(|ip| json!({ "ip": ip })).collect();
        let patch = json!({ "status": { "loadBalancer": { "ingress": ingress } } });

        services
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(e, "Service", &format!("{namespace}/{name}")))?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await
            .map_err(|e| store_error(e, "Secret", &format!("{namespace}/{name}")))?;

        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }
}

#[async_trait]
impl ArtifactStore for KubeStore {
    #[instrument(skip_all, fields(artifact = %artifact.reference()))]
    async fn apply(&self, artifact: &Artifact) -> StoreResult<()> {
        let (group, version) = artifact.group_version();
        let gvk = GroupVersionKind::gvk(group, version, artifact.kind());
        let (resource, scope) = self.resolve(&gvk).await?;

        let api: Api<DynamicObject> = match (scope, artifact.namespace()) {
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            (Scope::Namespaced, None) => {
                return Err(StoreError::Backend(format!(
                    "{} is namespaced but has no namespace",
                    artifact.reference()
                )))
            }
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(artifact.name(), &params, &Patch::Apply(artifact.as_value()))
            .await
            .map_err(|e| store_error(e, artifact.kind(), artifact.name()))?;

        debug!(
            resource_version = %applied.resource_version().unwrap_or_default(),
            "Applied artifact"
        );
        Ok(())
    }
}

/// Whether the cluster serves PodMonitors. Discovery failures count as no.
pub async fn supports_pod_monitors(client: &Client) -> bool {
    match client.list_api_group_resources(POD_MONITOR_API_VERSION).await {
        Ok(list) => {
            let supported = list.resources.iter().any(|r| r.kind == POD_MONITOR_KIND);
            info!(supported, "Checked PodMonitor support");
            supported
        }
        Err(e) => {
            warn!(
                api_version = POD_MONITOR_API_VERSION,
                error = %e,
                "PodMonitor discovery failed, assuming unsupported"
            );
            false
        }
    }
}
