//! Reconciliation controller.
//!
//! One pass over a group runs these phases in order:
//!
//! 1. **Fetch**: load the group; a missing group ends the pass quietly
//! 2. **Validate**: reject specs the schema cannot catch
//! 3. **Initialize**: default unset fields and persist; the write triggers
//!    the next pass, so this one stops here
//! 4. **ResolveAuth**: read the VRRP password from the referenced secret
//! 5. **AssignIds**: derive membership and persist the router id mapping
//!    when it changed
//! 6. **Converge**: render and apply the group's artifacts
//! 7. **PublishServiceStatus**: copy external IPs into the load balancer
//!    status of members that ask for it
//! 8. **ReportSuccess**: record the success condition
//!
//! Any failure after Fetch is recorded on the group's conditions before it
//! is returned, so the worker can requeue the key with backoff.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use keepalived_api::{GroupKey, KeepalivedGroup, GROUP_POD_LABEL};
use keepalived_reconcile::{allocate, conditions, derive_members, membership};
use kube::ResourceExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorContext;
use crate::converge::ConvergenceDriver;
use crate::error::ReconcileError;
use crate::queue::WorkQueue;
use crate::render::Renderer;
use crate::store::{ArtifactStore, Store};

/// Reconcile phase, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Validate,
    Initialize,
    ResolveAuth,
    AssignIds,
    Converge,
    PublishServiceStatus,
    ReportSuccess,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Fetch => "fetch",
            Phase::Validate => "validate",
            Phase::Initialize => "initialize",
            Phase::ResolveAuth => "resolve_auth",
            Phase::AssignIds => "assign_ids",
            Phase::Converge => "converge",
            Phase::PublishServiceStatus => "publish_service_status",
            Phase::ReportSuccess => "report_success",
        };
        f.write_str(name)
    }
}

/// Result of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The group no longer exists.
    NotFound,

    /// Defaults were written; the resulting update event drives the next pass.
    Initialized,

    /// Artifacts were applied and success recorded.
    Converged {
        artifacts: usize,
        router_ids_changed: bool,
    },
}

type PhaseResult<T> = Result<T, (Phase, ReconcileError)>;

fn failed<E: Into<ReconcileError>>(phase: Phase) -> impl FnOnce(E) -> (Phase, ReconcileError) {
    move |e| (phase, e.into())
}

/// Drives groups to their desired state.
pub struct Controller {
    store: Arc<dyn Store>,
    driver: ConvergenceDriver,
}

impl Controller {
    pub fn new<S>(store: Arc<S>, renderer: Arc<dyn Renderer>, context: Arc<OperatorContext>) -> Self
    where
        S: Store + 'static,
    {
        let artifacts: Arc<dyn ArtifactStore> = store.clone();
        Self {
            store,
            driver: ConvergenceDriver::new(renderer, artifacts, context),
        }
    }

    /// Run one reconcile pass for `key`.
    #[instrument(skip(self), fields(group = %key))]
    pub async fn reconcile(&self, key: &GroupKey) -> Result<Outcome, ReconcileError> {
        let mut group = match self.store.get_group(key).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                debug!("Group not found, nothing to reconcile");
                return Ok(Outcome::NotFound);
            }
            Err(e) => {
                error!(phase = %Phase::Fetch, error = %e, "Unable to fetch group");
                return Err(e.into());
            }
        };

        match self.drive(&mut group).await {
            Ok(outcome) => Ok(outcome),
            Err((phase, err)) => {
                error!(phase = %phase, error = %err, "Reconcile pass failed");
                if phase != Phase::ReportSuccess {
                    self.report_error(&group, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn drive(&self, group: &mut KeepalivedGroup) -> PhaseResult<Outcome> {
        let key = GroupKey::of(group);

        group.spec.validate().map_err(failed(Phase::Validate))?;

        if group.spec.apply_defaults() {
            *group = self
                .store
                .update_group(group)
                .await
                .map_err(failed(Phase::Initialize))?;
            info!("Applied defaults to group");
            return Ok(Outcome::Initialized);
        }

        let auth_pass = self
            .resolve_auth(group)
            .await
            .map_err(failed(Phase::ResolveAuth))?;

        let services = self
            .store
            .list_services()
            .await
            .map_err(failed(Phase::AssignIds))?;
        let members_services = membership::referencing_services(&services, &key);
        let members = derive_members(&members_services);

        let allocation = allocate(&group.router_ids(), &group.spec.blacklist(), &members)
            .map_err(failed(Phase::AssignIds))?;
        for (member, id) in &allocation.released {
            info!(member = %member, router_id = id, "Released router id");
        }
        for (member, id) in &allocation.assigned {
            info!(member = %member, router_id = id, "Assigned router id");
        }
        if allocation.changed {
            let mut assigned = group.clone();
            assigned.status_mut().router_ids = allocation.router_ids;
            *group = self
                .store
                .update_group_status(&assigned)
                .await
                .map_err(failed(Phase::AssignIds))?;
        }

        let labels = BTreeMap::from([(GROUP_POD_LABEL.to_string(), group.name_any())]);
        let pods = self
            .store
            .list_pods(&key.namespace, &labels)
            .await
            .map_err(failed(Phase::Converge))?;

        let applied = self
            .driver
            .converge(group, &members_services, &pods, &auth_pass)
            .await
            .map_err(failed(Phase::Converge))?;

        for service in &members_services {
            let Some(ips) = membership::published_ingress(service) else {
                continue;
            };
            let service_key = membership::service_key(service);
            self.store
                .update_service_ingress(
                    service.metadata.namespace.as_deref().unwrap_or_default(),
                    service.metadata.name.as_deref().unwrap_or_default(),
                    &ips,
                )
                .await
                .map_err(failed(Phase::PublishServiceStatus))?;
            info!(service = %service_key, ips = ?ips, "Published load balancer ingress");
        }

        let generation = group.metadata.generation;
        conditions::mark_success(group.status_mut(), generation, Utc::now());
        *group = self
            .store
            .update_group_status(group)
            .await
            .map_err(failed(Phase::ReportSuccess))?;

        info!(
            members = members.len(),
            artifacts = applied.len(),
            "Group reconciled"
        );
        Ok(Outcome::Converged {
            artifacts: applied.len(),
            router_ids_changed: allocation.changed,
        })
    }

    async fn resolve_auth(&self, group: &KeepalivedGroup) -> Result<String, ReconcileError> {
        let Some(auth) = group
            .spec
            .password_auth
            .as_ref()
            .filter(|auth| !auth.secret_ref.name.is_empty())
        else {
            return Ok(String::new());
        };

        let namespace = group.namespace().unwrap_or_default();
        let name = &auth.secret_ref.name;
        let data = self
            .store
            .get_secret(&namespace, name)
            .await?
            .ok_or_else(|| ReconcileError::SecretNotFound {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;

        let value = data
            .get(&auth.secret_key)
            .ok_or_else(|| ReconcileError::SecretKeyMissing {
                namespace: namespace.clone(),
                name: name.clone(),
                key: auth.secret_key.clone(),
            })?;
        Ok(String::from_utf8_lossy(value).into_owned())
    }

    /// Record a failed pass on the group. A failing write is only logged.
    async fn report_error(&self, group: &KeepalivedGroup, err: &ReconcileError) {
        let mut group = group.clone();
        let generation = group.metadata.generation;
        conditions::mark_error(group.status_mut(), generation, &err.to_string(), Utc::now());

        if let Err(e) = self.store.update_group_status(&group).await {
            warn!(error = %e, "Unable to record reconcile error on group status");
        }
    }

    /// Process keys from `queue` with `workers` concurrent workers until
    /// shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        queue: WorkQueue,
        workers: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(workers, "Starting controller");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let controller = Arc::clone(&self);
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                controller.work(worker, queue).await;
            }));
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Controller shutting down");
        queue.shutdown().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }

    async fn work(&self, worker: usize, queue: WorkQueue) {
        debug!(worker, "Worker started");
        while let Some(key) = queue.next().await {
            match self.reconcile(&key).await {
                Ok(outcome) => {
                    debug!(worker, group = %key, outcome = ?outcome, "Reconciled");
                    queue.forget(&key).await;
                }
                Err(e) => {
                    warn!(worker, group = %key, error = %e, "Reconcile failed, requeueing");
                    queue.add_rate_limited(key.clone()).await;
                }
            }
            queue.done(&key).await;
        }
        debug!(worker, "Worker stopped");
    }
}
