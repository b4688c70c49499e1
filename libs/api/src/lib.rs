//! # keepalived-api
//!
//! Resource types shared by the keepalived operator.
//!
//! ## Contents
//!
//! - [`KeepalivedGroup`]: the custom resource, its spec, and its status
//!   (`routerIDs` and `conditions`)
//! - [`GroupKey`]: the `namespace/name` identity used by the trigger layer
//! - Well-known annotation and label keys linking services and pods to a group
//!
//! ## Wire format
//!
//! JSON field names match the `redhatcop.redhat.io/v1alpha1` schema, so
//! objects written by earlier operator releases deserialize unchanged.

mod error;
mod group;
mod key;

pub use error::{ReferenceError, ValidationError};
pub use group::*;
pub use key::GroupKey;

/// API group of the `KeepalivedGroup` resource.
pub const API_GROUP: &str = "redhatcop.redhat.io";

/// Annotation on a service naming the group (`namespace/name`) that should
/// announce its external IPs.
pub const GROUP_ANNOTATION: &str = "keepalived-operator.redhat-cop.io/keepalivedgroup";

/// Annotation on a service requesting one VRRP instance per external IP.
pub const SPREAD_VIPS_ANNOTATION: &str = "keepalived-operator.redhat-cop.io/spreadvips";

/// Annotation on a service asking the operator to publish its external IPs
/// as the service's load balancer ingress.
pub const UPDATE_SERVICE_STATUS_ANNOTATION: &str =
    "keepalived-operator.redhat-cop.io/updateservicestatus";

/// Annotation on a service carrying per-instance keepalived settings as a
/// JSON object.
pub const VERBATIM_CONFIG_ANNOTATION: &str = "keepalived-operator.redhat-cop.io/verbatimconfig";

/// Label on keepalived pods naming the group they run for.
pub const GROUP_POD_LABEL: &str = "keepalivedGroup";

/// Image used when `spec.image` is empty.
pub const DEFAULT_IMAGE: &str = "registry.redhat.io/openshift4/ose-keepalived-ipfailover";

/// Secret key used when `spec.passwordAuth.secretKey` is empty.
pub const DEFAULT_SECRET_KEY: &str = "password";
