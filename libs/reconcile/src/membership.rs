//! Group membership derived from services.
//!
//! A service belongs to a group when it carries the group annotation and
//! actually exposes external addresses (type `LoadBalancer`, or explicit
//! `externalIPs`). Each such service is one VRRP instance keyed by
//! `namespace/name`, unless it asks for its VIPs to be spread, in which case
//! every address becomes its own instance keyed `namespace/name/ip`.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;
use keepalived_api::{
    GroupKey, ReferenceError, GROUP_ANNOTATION, SPREAD_VIPS_ANNOTATION,
    UPDATE_SERVICE_STATUS_ANNOTATION,
};
use tracing::warn;

const LOAD_BALANCER: &str = "LoadBalancer";

/// `namespace/name` of a service.
pub fn service_key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.metadata.namespace.as_deref().unwrap_or_default(),
        service.metadata.name.as_deref().unwrap_or_default()
    )
}

fn annotation<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn explicit_external_ips(service: &Service) -> &[String] {
    service
        .spec
        .as_ref()
        .and_then(|s| s.external_ips.as_deref())
        .unwrap_or_default()
}

/// Whether the service exposes addresses keepalived could announce.
pub fn is_eligible(service: &Service) -> bool {
    let load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == LOAD_BALANCER);

    load_balancer || !explicit_external_ips(service).is_empty()
}

/// The group named by the service annotation, if the annotation is present.
pub fn group_reference(service: &Service) -> Option<Result<GroupKey, ReferenceError>> {
    annotation(service, GROUP_ANNOTATION).map(GroupKey::parse)
}

/// Whether the service asks for one VRRP instance per address.
pub fn spreads_vips(service: &Service) -> bool {
    annotation(service, SPREAD_VIPS_ANNOTATION) == Some("true")
}

/// IPs assigned by the load balancer. Hostname-only ingress is skipped.
pub fn load_balancer_ips(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
        .unwrap_or_default()
}

/// Sorted union of two address lists, ignoring empty entries.
pub fn merge_addresses<A, B>(first: A, second: B) -> Vec<String>
where
    A: IntoIterator,
    A::Item: Into<String>,
    B: IntoIterator,
    B::Item: Into<String>,
{
    first
        .into_iter()
        .map(Into::into)
        .chain(second.into_iter().map(Into::into))
        .filter(|ip| !ip.is_empty())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// Every externally visible address of the service.
pub fn external_addresses(service: &Service) -> Vec<String> {
    merge_addresses(
        load_balancer_ips(service),
        explicit_external_ips(service).iter().cloned(),
    )
}

/// Ingress IPs to publish on the service status, if the service asks for it
/// and its status does not already list exactly its external IPs.
pub fn published_ingress(service: &Service) -> Option<Vec<String>> {
    if annotation(service, UPDATE_SERVICE_STATUS_ANNOTATION) != Some("true") {
        return None;
    }

    let external: Vec<String> = explicit_external_ips(service)
        .iter()
        .filter(|ip| !ip.is_empty())
        .cloned()
        .collect();
    if external.is_empty() || load_balancer_ips(service) == external {
        return None;
    }
    Some(external)
}

/// Member keys contributed by one service.
pub fn member_keys(service: &Service) -> Vec<String> {
    let key = service_key(service);
    if spreads_vips(service) {
        external_addresses(service)
            .into_iter()
            .map(|ip| format!("{key}/{ip}"))
            .collect()
    } else {
        vec![key]
    }
}

/// Canonical membership set of the given services.
pub fn derive_members<'a, I>(services: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Service>,
{
    services.into_iter().flat_map(member_keys).collect()
}

/// Services that are members of `group`, sorted by namespace then name.
///
/// Services with a malformed group annotation are logged and skipped.
pub fn referencing_services(services: &[Service], group: &GroupKey) -> Vec<Service> {
    let mut result: Vec<Service> = services
        .iter()
        .filter(|service| {
            if !is_eligible(service) {
                return false;
            }
            match group_reference(service) {
                Some(Ok(key)) => &key == group,
                Some(Err(e)) => {
                    warn!(
                        service = %service_key(service),
                        annotation = GROUP_ANNOTATION,
                        error = %e,
                        "Unable to parse group reference"
                    );
                    false
                }
                None => false,
            }
        })
        .cloned()
        .collect();

    result.sort_by(|a, b| {
        (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
    });
    result
}
