//! Convergence: render the group's artifacts and push them to the store.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Service};
use keepalived_api::{GroupKey, KeepalivedGroup};
use tracing::{debug, info, instrument, warn};

use crate::artifact::ArtifactRef;
use crate::config::OperatorContext;
use crate::error::ReconcileError;
use crate::render::{Misc, RenderContext, Renderer};
use crate::store::ArtifactStore;

/// Renders artifacts for a group and upserts them in order.
pub struct ConvergenceDriver {
    renderer: Arc<dyn Renderer>,
    store: Arc<dyn ArtifactStore>,
    context: Arc<OperatorContext>,
}

impl ConvergenceDriver {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        store: Arc<dyn ArtifactStore>,
        context: Arc<OperatorContext>,
    ) -> Self {
        Self {
            renderer,
            store,
            context,
        }
    }

    /// Render and apply every artifact of `group`.
    ///
    /// Artifacts are applied in template order. The first failure stops the
    /// pass; artifacts already applied stay applied. Returns the applied
    /// artifacts.
    #[instrument(skip_all, fields(group = %GroupKey::of(group)))]
    pub async fn converge(
        &self,
        group: &KeepalivedGroup,
        services: &[Service],
        pods: &[Pod],
        auth_pass: &str,
    ) -> Result<Vec<ArtifactRef>, ReconcileError> {
        let mut services = services.to_vec();
        services.sort_by(|a, b| {
            (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
        });
        let mut pods = pods.to_vec();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let context = RenderContext {
            group,
            services: &services,
            pods: &pods,
            misc: Misc {
                image: self.context.config.image.clone(),
                supports_pod_monitor: self.context.supports_pod_monitor.to_string(),
                auth_pass: auth_pass.to_string(),
            },
        };

        let artifacts = self.renderer.render(&context)?;
        debug!(count = artifacts.len(), "Rendered artifacts");

        let mut applied = Vec::with_capacity(artifacts.len());
        for mut artifact in artifacts {
            artifact.adopt(group);
            let reference = artifact.reference();

            if let Err(source) = self.store.apply(&artifact).await {
                warn!(artifact = %reference, error = %source, "Unable to apply artifact");
                return Err(ReconcileError::Apply {
                    artifact: reference,
                    source,
                });
            }
            debug!(artifact = %reference, "Applied artifact");
            applied.push(reference);
        }

        info!(count = applied.len(), "Artifacts converged");
        Ok(applied)
    }
}
