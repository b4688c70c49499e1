//! Change routing: which resource events matter, and which groups they
//! affect.
//!
//! Each watched kind pairs a [`TriggerPredicate`] (does this event warrant
//! any work?) with a [`ChangeRouter`] (which group keys must be
//! reconciled?). [`Trigger`] combines the two.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Pod, Service};
use keepalived_api::{GroupKey, KeepalivedGroup, GROUP_POD_LABEL};
use keepalived_reconcile::membership::{group_reference, is_eligible, service_key};
use kube::ResourceExt;
use tracing::warn;

/// A change observed on a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<K> {
    Created(K),
    Updated { old: K, new: K },
    Deleted(K),
}

/// Decides whether an event is worth routing at all.
pub trait TriggerPredicate<K>: Send + Sync {
    fn should_trigger(&self, event: &ResourceEvent<K>) -> bool;
}

/// Maps an event to the groups it affects.
pub trait ChangeRouter<K>: Send + Sync {
    fn on_create(&self, object: &K) -> BTreeSet<GroupKey>;

    fn on_update(&self, old: &K, new: &K) -> BTreeSet<GroupKey>;

    fn on_delete(&self, object: &K) -> BTreeSet<GroupKey>;

    fn route(&self, event: &ResourceEvent<K>) -> BTreeSet<GroupKey> {
        match event {
            ResourceEvent::Created(object) => self.on_create(object),
            ResourceEvent::Updated { old, new } => self.on_update(old, new),
            ResourceEvent::Deleted(object) => self.on_delete(object),
        }
    }
}

/// Predicate and router for one watched kind.
pub struct Trigger<K> {
    predicate: Box<dyn TriggerPredicate<K>>,
    router: Box<dyn ChangeRouter<K>>,
}

impl<K> Trigger<K> {
    pub fn new(
        predicate: impl TriggerPredicate<K> + 'static,
        router: impl ChangeRouter<K> + 'static,
    ) -> Self {
        Self {
            predicate: Box::new(predicate),
            router: Box::new(router),
        }
    }

    /// Group keys to enqueue for `event`.
    pub fn keys(&self, event: &ResourceEvent<K>) -> BTreeSet<GroupKey> {
        if self.predicate.should_trigger(event) {
            self.router.route(event)
        } else {
            BTreeSet::new()
        }
    }
}

// =============================================================================
// KeepalivedGroup
// =============================================================================

/// Group updates matter only when the generation or the finalizers change;
/// status-only writes are ignored.
pub struct GroupChangePredicate;

impl TriggerPredicate<KeepalivedGroup> for GroupChangePredicate {
    fn should_trigger(&self, event: &ResourceEvent<KeepalivedGroup>) -> bool {
        match event {
            ResourceEvent::Updated { old, new } => {
                old.metadata.generation != new.metadata.generation
                    || old.metadata.finalizers != new.metadata.finalizers
            }
            _ => true,
        }
    }
}

/// Routes a group event to the group itself.
pub struct GroupRouter;

impl ChangeRouter<KeepalivedGroup> for GroupRouter {
    fn on_create(&self, object: &KeepalivedGroup) -> BTreeSet<GroupKey> {
        BTreeSet::from([GroupKey::of(object)])
    }

    fn on_update(&self, _old: &KeepalivedGroup, new: &KeepalivedGroup) -> BTreeSet<GroupKey> {
        BTreeSet::from([GroupKey::of(new)])
    }

    fn on_delete(&self, object: &KeepalivedGroup) -> BTreeSet<GroupKey> {
        BTreeSet::from([GroupKey::of(object)])
    }
}

// =============================================================================
// Service
// =============================================================================

/// Services matter when they are eligible and carry the group annotation,
/// before or after the change.
pub struct AnnotatedServicePredicate;

impl AnnotatedServicePredicate {
    fn qualifies(service: &Service) -> bool {
        is_eligible(service) && group_reference(service).is_some()
    }
}

impl TriggerPredicate<Service> for AnnotatedServicePredicate {
    fn should_trigger(&self, event: &ResourceEvent<Service>) -> bool {
        match event {
            ResourceEvent::Created(service) | ResourceEvent::Deleted(service) => {
                Self::qualifies(service)
            }
            ResourceEvent::Updated { old, new } => Self::qualifies(old) || Self::qualifies(new),
        }
    }
}

/// Routes a service event to the group it names. Updates route both the
/// old and the new reference, so moving a service between groups releases
/// its ids in the old one.
pub struct ServiceRouter;

impl ServiceRouter {
    fn referenced(service: &Service) -> Option<GroupKey> {
        match group_reference(service)? {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(
                    service = %service_key(service),
                    error = %e,
                    "Unable to route service with malformed group reference"
                );
                None
            }
        }
    }
}

impl ChangeRouter<Service> for ServiceRouter {
    fn on_create(&self, object: &Service) -> BTreeSet<GroupKey> {
        Self::referenced(object).into_iter().collect()
    }

    fn on_update(&self, old: &Service, new: &Service) -> BTreeSet<GroupKey> {
        Self::referenced(old)
            .into_iter()
            .chain(Self::referenced(new))
            .collect()
    }

    fn on_delete(&self, object: &Service) -> BTreeSet<GroupKey> {
        Self::referenced(object).into_iter().collect()
    }
}

// =============================================================================
// Pod
// =============================================================================

fn group_label(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(GROUP_POD_LABEL))
        .map(String::as_str)
}

/// Keepalived pods matter when they appear or disappear. Updates are
/// ignored: peer lists only change with the pod set.
pub struct KeepalivedPodPredicate;

impl TriggerPredicate<Pod> for KeepalivedPodPredicate {
    fn should_trigger(&self, event: &ResourceEvent<Pod>) -> bool {
        match event {
            ResourceEvent::Created(pod) | ResourceEvent::Deleted(pod) => group_label(pod).is_some(),
            ResourceEvent::Updated { .. } => false,
        }
    }
}

/// Routes a keepalived pod to the group in its own namespace named by its
/// label.
pub struct PodRouter;

impl PodRouter {
    fn owner(pod: &Pod) -> BTreeSet<GroupKey> {
        match (pod.namespace(), group_label(pod)) {
            (Some(namespace), Some(name)) if !name.is_empty() => {
                BTreeSet::from([GroupKey::new(namespace, name)])
            }
            _ => BTreeSet::new(),
        }
    }
}

impl ChangeRouter<Pod> for PodRouter {
    fn on_create(&self, object: &Pod) -> BTreeSet<GroupKey> {
        Self::owner(object)
    }

    fn on_update(&self, _old: &Pod, new: &Pod) -> BTreeSet<GroupKey> {
        Self::owner(new)
    }

    fn on_delete(&self, object: &Pod) -> BTreeSet<GroupKey> {
        Self::owner(object)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keepalived_api::{KeepalivedGroupSpec, GROUP_ANNOTATION};
    use rstest::rstest;

    use super::*;

    fn service(reference: Option<&str>, type_: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                annotations: reference
                    .map(|r| BTreeMap::from([(GROUP_ANNOTATION.to_string(), r.to_string())])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(label: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("keepalived".to_string()),
                name: Some("vip-abcde".to_string()),
                labels: label.map(|l| BTreeMap::from([(GROUP_POD_LABEL.to_string(), l.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn group(generation: i64, finalizers: &[&str]) -> KeepalivedGroup {
        let mut group = KeepalivedGroup::new("vip", KeepalivedGroupSpec::default());
        group.metadata.namespace = Some("keepalived".to_string());
        group.metadata.generation = Some(generation);
        if !finalizers.is_empty() {
            group.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        group
    }

    fn keys(list: &[(&str, &str)]) -> BTreeSet<GroupKey> {
        list.iter().map(|(ns, name)| GroupKey::new(*ns, *name)).collect()
    }

    fn trigger_groups() -> Trigger<KeepalivedGroup> {
        Trigger::new(GroupChangePredicate, GroupRouter)
    }

    #[test]
    fn test_group_status_only_update_is_ignored() {
        let old = group(1, &[]);
        let mut new = group(1, &[]);
        new.status_mut().router_ids.insert("default/web".to_string(), 1);

        assert!(trigger_groups()
            .keys(&ResourceEvent::Updated { old, new })
            .is_empty());
    }

    #[rstest]
    #[case(group(2, &[]))]
    #[case(group(1, &["example.com/cleanup"]))]
    fn test_group_spec_or_finalizer_update_routes_to_itself(#[case] new: KeepalivedGroup) {
        let old = group(1, &[]);
        assert_eq!(
            trigger_groups().keys(&ResourceEvent::Updated { old, new }),
            keys(&[("keepalived", "vip")])
        );
    }

    #[test]
    fn test_group_create_and_delete_route_to_itself() {
        let trigger = trigger_groups();
        let expected = keys(&[("keepalived", "vip")]);
        assert_eq!(trigger.keys(&ResourceEvent::Created(group(1, &[]))), expected);
        assert_eq!(trigger.keys(&ResourceEvent::Deleted(group(1, &[]))), expected);
    }

    #[rstest]
    #[case(Some("keepalived/vip"), "LoadBalancer", &[("keepalived", "vip")])]
    #[case(Some("keepalived/vip"), "ClusterIP", &[])]
    #[case(None, "LoadBalancer", &[])]
    #[case(Some("vip"), "LoadBalancer", &[])]
    fn test_service_create(
        #[case] reference: Option<&str>,
        #[case] type_: &str,
        #[case] expected: &[(&str, &str)],
    ) {
        let trigger = Trigger::new(AnnotatedServicePredicate, ServiceRouter);
        assert_eq!(
            trigger.keys(&ResourceEvent::Created(service(reference, type_))),
            keys(expected)
        );
    }

    #[test]
    fn test_service_moving_between_groups_routes_both() {
        let trigger = Trigger::new(AnnotatedServicePredicate, ServiceRouter);
        let event = ResourceEvent::Updated {
            old: service(Some("keepalived/a"), "LoadBalancer"),
            new: service(Some("keepalived/b"), "LoadBalancer"),
        };
        assert_eq!(
            trigger.keys(&event),
            keys(&[("keepalived", "a"), ("keepalived", "b")])
        );
    }

    #[test]
    fn test_service_losing_annotation_routes_old_group() {
        let trigger = Trigger::new(AnnotatedServicePredicate, ServiceRouter);
        let event = ResourceEvent::Updated {
            old: service(Some("keepalived/a"), "LoadBalancer"),
            new: service(None, "LoadBalancer"),
        };
        assert_eq!(trigger.keys(&event), keys(&[("keepalived", "a")]));
    }

    #[test]
    fn test_service_becoming_ineligible_routes_group() {
        let trigger = Trigger::new(AnnotatedServicePredicate, ServiceRouter);
        let event = ResourceEvent::Updated {
            old: service(Some("keepalived/a"), "LoadBalancer"),
            new: service(Some("keepalived/a"), "ClusterIP"),
        };
        assert_eq!(trigger.keys(&event), keys(&[("keepalived", "a")]));
    }

    #[test]
    fn test_pod_events() {
        let trigger = Trigger::new(KeepalivedPodPredicate, PodRouter);
        let expected = keys(&[("keepalived", "vip")]);

        assert_eq!(trigger.keys(&ResourceEvent::Created(pod(Some("vip")))), expected);
        assert_eq!(trigger.keys(&ResourceEvent::Deleted(pod(Some("vip")))), expected);
        assert!(trigger
            .keys(&ResourceEvent::Updated {
                old: pod(Some("vip")),
                new: pod(Some("vip")),
            })
            .is_empty());
        assert!(trigger.keys(&ResourceEvent::Created(pod(None))).is_empty());
    }
}
