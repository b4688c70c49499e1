//! Template rendering.
//!
//! The template receives the group, its member services, its keepalived
//! pods and a few operator facts, and produces YAML: either several
//! documents separated by `---`, or a single document holding a sequence.
//! Each resulting object becomes an [`Artifact`].
//!
//! Functions available to templates:
//!
//! - `parseJson(s)`: a JSON object string as a map of strings, empty on
//!   missing or malformed input
//! - `mergeStringSlices(ingress, externalIPs)`: sorted union of load
//!   balancer ingress IPs and explicit external IPs
//! - `modulus(a, b)`: `a % b`, an error when `b` is zero

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{Pod, Service};
use keepalived_api::KeepalivedGroup;
use keepalived_reconcile::membership::merge_addresses;
use minijinja::value::Value as TemplateValue;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::artifact::Artifact;

const TEMPLATE_NAME: &str = "keepalived";

/// Rendering errors.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Template file could not be read.
    #[error("unable to read template {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Template failed to compile or evaluate.
    #[error("template error: {0}")]
    Template(String),

    /// Output was not valid YAML.
    #[error("rendered template is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Output held something that is not a Kubernetes object.
    #[error("invalid rendered object: {0}")]
    InvalidArtifact(String),
}

impl From<minijinja::Error> for RenderError {
    fn from(err: minijinja::Error) -> Self {
        Self::Template(err.to_string())
    }
}

/// Data handed to the template.
#[derive(Debug, Serialize)]
pub struct RenderContext<'a> {
    #[serde(rename = "KeepalivedGroup")]
    pub group: &'a KeepalivedGroup,

    /// Member services, sorted by namespace then name.
    #[serde(rename = "Services")]
    pub services: &'a [Service],

    /// Keepalived pods of the group, sorted by name.
    #[serde(rename = "KeepalivedPods")]
    pub pods: &'a [Pod],

    #[serde(rename = "Misc")]
    pub misc: Misc,
}

/// Operator facts exposed as `Misc`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Misc {
    /// Operator image.
    pub image: String,

    /// `"true"` when the cluster serves PodMonitors.
    #[serde(rename = "supportsPodMonitor")]
    pub supports_pod_monitor: String,

    /// Resolved VRRP password, empty without password authentication.
    #[serde(rename = "authPass")]
    pub auth_pass: String,
}

/// Turns a render context into artifacts.
pub trait Renderer: Send + Sync {
    fn render(&self, context: &RenderContext<'_>) -> Result<Vec<Artifact>, RenderError>;
}

/// Renderer backed by a minijinja template.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    /// Load and compile the template at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RenderError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| RenderError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_source(source)
    }

    /// Compile a template from its source text.
    pub fn from_source(source: impl Into<String>) -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_function("parseJson", parse_json);
        env.add_function("mergeStringSlices", merge_string_slices);
        env.add_function("modulus", modulus);
        env.add_template_owned(TEMPLATE_NAME, source.into())?;
        Ok(Self { env })
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, context: &RenderContext<'_>) -> Result<Vec<Artifact>, RenderError> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        let rendered = template.render(context)?;
        parse_artifacts(&rendered)
    }
}

/// Split rendered YAML into artifacts. Empty documents and null sequence
/// items are skipped.
pub fn parse_artifacts(rendered: &str) -> Result<Vec<Artifact>, RenderError> {
    let mut artifacts = Vec::new();
    for document in serde_yaml::Deserializer::from_str(rendered) {
        match Value::deserialize(document)? {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.into_iter().filter(|i| !i.is_null()) {
                    artifacts.push(Artifact::from_value(item)?);
                }
            }
            object => artifacts.push(Artifact::from_value(object)?),
        }
    }
    Ok(artifacts)
}

// =============================================================================
// Template functions
// =============================================================================

fn parse_json(raw: Option<String>) -> TemplateValue {
    let raw = raw.unwrap_or_default();
    if raw.trim().is_empty() {
        return TemplateValue::from_serialize(BTreeMap::<String, String>::new());
    }
    match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
        Ok(map) => TemplateValue::from_serialize(&map),
        Err(e) => {
            warn!(input = %raw, error = %e, "Unable to parse verbatim config as a JSON object");
            TemplateValue::from_serialize(BTreeMap::<String, String>::new())
        }
    }
}

fn absent(value: &TemplateValue) -> bool {
    value.is_undefined() || value.is_none()
}

fn merge_string_slices(
    ingress: TemplateValue,
    external_ips: TemplateValue,
) -> Result<Vec<String>, minijinja::Error> {
    let mut ingress_ips = Vec::new();
    if !absent(&ingress) {
        for entry in ingress.try_iter()? {
            let ip = entry.get_attr("ip")?;
            if let Some(ip) = ip.as_str() {
                ingress_ips.push(ip.to_string());
            }
        }
    }

    let mut explicit = Vec::new();
    if !absent(&external_ips) {
        for ip in external_ips.try_iter()? {
            if let Some(ip) = ip.as_str() {
                explicit.push(ip.to_string());
            }
        }
    }

    Ok(merge_addresses(ingress_ips, explicit))
}

fn modulus(dividend: i64, divisor: i64) -> Result<i64, minijinja::Error> {
    if divisor == 0 {
        return Err(minijinja::Error::new(
            ErrorKind::InvalidOperation,
            "modulus by zero",
        ));
    }
    Ok(dividend % divisor)
}
