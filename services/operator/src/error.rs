//! Reconcile errors.

use keepalived_api::ValidationError;
use keepalived_reconcile::AllocationError;
use thiserror::Error;

use crate::artifact::ArtifactRef;
use crate::render::RenderError;
use crate::store::StoreError;

/// Why a reconcile pass failed. The display text is what ends up in the
/// group's `ReconcileError` condition.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The group spec is invalid.
    #[error("invalid keepalived group: {0}")]
    Validation(#[from] ValidationError),

    /// The password secret does not exist.
    #[error("unable to find secret {name} in namespace {namespace}")]
    SecretNotFound { namespace: String, name: String },

    /// The password secret exists but lacks the configured key.
    #[error("unable to find key {key} in secret {name} in namespace {namespace}")]
    SecretKeyMissing {
        namespace: String,
        name: String,
        key: String,
    },

    /// No router id left for a member.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// The template could not be rendered into artifacts.
    #[error("unable to process keepalived template: {0}")]
    Render(#[from] RenderError),

    /// Creating or updating one artifact failed.
    #[error("unable to create or update {artifact}: {source}")]
    Apply {
        artifact: ArtifactRef,
        #[source]
        source: StoreError,
    },

    /// Reading or writing the group, services, pods or secrets failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
