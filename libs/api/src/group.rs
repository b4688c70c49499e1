//! The `KeepalivedGroup` custom resource.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ValidationError, DEFAULT_IMAGE, DEFAULT_SECRET_KEY};

/// Desired state of a group of VRRP instances sharing one interface.
///
/// Every service that references the group through the
/// `keepalived-operator.redhat-cop.io/keepalivedgroup` annotation becomes one
/// (or, when spreading, several) VRRP instances in the rendered keepalived
/// configuration.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "redhatcop.redhat.io",
    version = "v1alpha1",
    kind = "KeepalivedGroup",
    namespaced,
    shortname = "kag",
    doc = "KeepalivedGroup manages a set of keepalived daemons announcing the external IPs of the services that reference it."
)]
#[kube(status = "KeepalivedGroupStatus")]
#[serde(rename_all = "camelCase")]
pub struct KeepalivedGroupSpec {
    /// Node selector for the keepalived daemonset.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Keepalived image. Defaulted when empty.
    #[serde(default)]
    pub image: String,

    /// Host interface carrying the VIPs.
    pub interface: String,

    /// Select the interface by one of its IPv4 addresses instead of by name.
    #[serde(
        default,
        rename = "interfaceFromIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub interface_from_ip: Option<String>,

    /// VRRP password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_auth: Option<PasswordAuth>,

    /// Global keepalived settings copied verbatim into the configuration.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verbatim_config: BTreeMap<String, String>,

    /// Router ids that must never be assigned, e.g. because another VRRP
    /// speaker on the same segment already uses them.
    #[serde(
        default,
        rename = "blacklistRouterIDs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub blacklist_router_ids: Vec<i32>,

    /// Announce to the keepalived pods directly instead of by multicast.
    #[serde(default)]
    pub unicast_enabled: bool,

    #[serde(
        default,
        rename = "DaemonsetPodPriorityClassName",
        skip_serializing_if = "Option::is_none"
    )]
    pub daemonset_pod_priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub daemonset_pod_annotations: BTreeMap<String, String>,
}

/// Reference to the secret holding the VRRP password.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuth {
    /// Secret holding the password. An empty name disables authentication.
    #[serde(default)]
    pub secret_ref: SecretReference,

    /// Key inside the secret. Defaults to `password`.
    #[serde(default)]
    pub secret_key: String,
}

/// Name of a secret in the group's namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SecretReference {
    #[serde(default)]
    pub name: String,
}

/// Observed state of a group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeepalivedGroupStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Member key to assigned VRRP router id.
    #[serde(
        default,
        rename = "routerIDs",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub router_ids: BTreeMap<String, i32>,
}

/// A timestamped observation attached to the group status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// `True`, `False` or `Unknown`.
    pub status: String,

    pub reason: String,

    #[serde(default)]
    pub message: String,

    pub last_transition_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl KeepalivedGroupSpec {
    /// Structural and semantic checks that the schema cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interface.trim().is_empty() {
            return Err(ValidationError::MissingInterface);
        }

        let mut seen = BTreeSet::new();
        for &id in &self.blacklist_router_ids {
            if !(1..=255).contains(&id) {
                return Err(ValidationError::BlacklistOutOfRange(id));
            }
            if !seen.insert(id) {
                return Err(ValidationError::DuplicateBlacklistEntry(id));
            }
        }

        if let Some(ip) = self.interface_from_ip.as_deref() {
            if !ip.is_empty() && ip.parse::<Ipv4Addr>().is_err() {
                return Err(ValidationError::InvalidInterfaceFromIp(ip.to_string()));
            }
        }

        Ok(())
    }

    /// Fills unset optional fields.
    ///
    /// Returns true if anything was defaulted; the caller must persist the
    /// object before acting on it.
    pub fn apply_defaults(&mut self) -> bool {
        let mut defaulted = false;

        if self.image.is_empty() {
            self.image = DEFAULT_IMAGE.to_string();
            defaulted = true;
        }

        if let Some(auth) = self.password_auth.as_mut() {
            if auth.secret_key.is_empty() {
                auth.secret_key = DEFAULT_SECRET_KEY.to_string();
                defaulted = true;
            }
        }

        defaulted
    }

    /// Blacklisted ids as a set.
    pub fn blacklist(&self) -> BTreeSet<i32> {
        self.blacklist_router_ids.iter().copied().collect()
    }
}

impl KeepalivedGroup {
    /// Persisted router ids, empty when no status was ever written.
    pub fn router_ids(&self) -> BTreeMap<String, i32> {
        self.status
            .as_ref()
            .map(|s| s.router_ids.clone())
            .unwrap_or_default()
    }

    /// Mutable status, created on first access.
    pub fn status_mut(&mut self) -> &mut KeepalivedGroupStatus {
        self.status.get_or_insert_with(KeepalivedGroupStatus::default)
    }

    /// Looks up a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
    }
}
