//! The reconcile state machine
//!
//! Each reconcile of a parent key runs: fetch → finalizer → expectation
//! gate → revision construction → sync → status write. Teardown replaces
//! the sync phase once the parent carries a deletion timestamp, releasing
//! sub-resources, targets, and the ID pool in strict order before the
//! finalizer comes off.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use xset_api::adapter::{ResourceContextAdapter, XSetController};
use xset_api::events::{actions, reasons, EventPublisher};
use xset_api::types::{add_or_update_condition, find_condition, XSetStatus, XSET_TERMINATING};
use xset_api::{error as error_util, Error, Result};

use crate::expectations::{object_key, CacheExpectations, CacheReader, EXPECTATION_REQUEUE};
use crate::metrics::{self, ReconcileTimer};
use crate::resource_context::ResourceContextControl;
use crate::revision::RevisionManager;
use crate::subresources::PvcControl;
use crate::sync::{SyncContext, SyncControl};
use crate::targets::TargetControl;

/// Backoff applied by [`error_policy`] after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Reasons carried by the `XSetTerminating` condition, one per teardown stage
pub mod teardown_reasons {
    /// Orphaning retained PVCs failed
    pub const RECLAIM_SUB_RESOURCES_FAILED: &str = "ReclaimSubResourcesFailed";
    /// Stripping decoration ownerReferences failed
    pub const RECLAIM_OWNER_REFERENCES_FAILED: &str = "ReclaimOwnerReferencesFailed";
    /// Targets are still being deleted
    pub const RECLAIMING_TARGETS_DELETION: &str = "ReclaimingTargetsDeletion";
    /// Deleting targets failed
    pub const RECLAIM_TARGETS_DELETION_FAILED: &str = "ReclaimTargetsDeletionFailed";
    /// Releasing the ID pool failed
    pub const RECLAIM_RESOURCE_CONTEXT: &str = "ReclaimResourceContext";
    /// Teardown is complete; the finalizer may come off
    pub const DELETED: &str = "Deleted";
}

/// Client seam for the parent object
#[async_trait]
pub trait XSetClient<C: XSetController>: Send + Sync {
    /// Get a parent by namespace/name; `None` on 404
    async fn get_xset(&self, namespace: &str, name: &str) -> Result<Option<C::XSet>>;

    /// Write the parent's status subresource, returning the updated object
    async fn update_status(&self, xset: &C::XSet) -> Result<C::XSet>;

    /// Ensure the finalizer is present (no-op when it already is)
    async fn add_finalizer(&self, xset: &C::XSet, finalizer: &str) -> Result<()>;

    /// Ensure the finalizer is absent (no-op when it already is)
    async fn remove_finalizer(&self, xset: &C::XSet, finalizer: &str) -> Result<()>;
}

/// Production [`XSetClient`] over a typed `Api`
pub struct KubeXSetClient<C> {
    client: Client,
    _controller: PhantomData<C>,
}

impl<C> KubeXSetClient<C> {
    /// Create a parent client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _controller: PhantomData,
        }
    }
}

#[async_trait]
impl<C: XSetController> XSetClient<C> for KubeXSetClient<C> {
    async fn get_xset(&self, namespace: &str, name: &str) -> Result<Option<C::XSet>> {
        let api: Api<C::XSet> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if error_util::is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_status(&self, xset: &C::XSet) -> Result<C::XSet> {
        let namespace = xset.namespace().unwrap_or_default();
        let api: Api<C::XSet> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(xset).map_err(|e| {
            Error::internal_with_context("status", format!("serialize status: {e}"))
        })?;
        Ok(api
            .replace_status(&xset.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn add_finalizer(&self, xset: &C::XSet, finalizer: &str) -> Result<()> {
        let namespace = xset.namespace().unwrap_or_default();
        let name = xset.name_any();
        let api: Api<C::XSet> = Api::namespaced(self.client.clone(), &namespace);

        let current = match api.get(&name).await {
            Ok(obj) => obj,
            Err(err) if error_util::is_not_found(&err) => {
                debug!(xset = %name, "object gone, skipping finalizer addition");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut finalizers = current.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, xset: &C::XSet, finalizer: &str) -> Result<()> {
        let namespace = xset.namespace().unwrap_or_default();
        let name = xset.name_any();
        let api: Api<C::XSet> = Api::namespaced(self.client.clone(), &namespace);

        let current = match api.get(&name).await {
            Ok(obj) => obj,
            Err(err) if error_util::is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let finalizers: Vec<String> = current
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        if finalizers.len() == current.finalizers().len() {
            return Ok(());
        }

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared context for reconciling one concrete controller's parents
pub struct XSetContext<C: XSetController, RA: ResourceContextAdapter> {
    /// The concrete controller adapter
    pub controller: Arc<C>,
    /// Client for the parent object
    pub client: Arc<dyn XSetClient<C>>,
    /// Client for listing and mutating targets
    pub target_control: Arc<dyn TargetControl<C>>,
    /// Scale/replace/update policy
    pub sync_control: Arc<dyn SyncControl<C>>,
    /// Revision-history helper
    pub revision_manager: Arc<dyn RevisionManager<C>>,
    /// Instance-ID allocator
    pub resource_contexts: Arc<ResourceContextControl<C, RA>>,
    /// PVC sub-resource capability, when the controller has one
    pub pvc_control: Option<Arc<dyn PvcControl<C>>>,
    /// The cache-expectation gate
    pub expectations: Arc<CacheExpectations>,
    /// Reader the gate checks the informer cache through
    pub cache_reader: Arc<dyn CacheReader>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

/// Reconcile one parent
///
/// Returns the requeue action for the work queue; errors are handed to
/// [`error_policy`] for backoff.
#[instrument(skip(xset, ctx), fields(xset = %xset.name_any()))]
pub async fn reconcile<C, RA>(
    xset: Arc<C::XSet>,
    ctx: Arc<XSetContext<C, RA>>,
) -> std::result::Result<Action, Error>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let namespace = xset.namespace().unwrap_or_default();
    let name = xset.name_any();
    let key = object_key(xset.as_ref());
    let timer = ReconcileTimer::start(&key);

    // re-read through the client so a deleted parent is observed as such
    let Some(live) = ctx.client.get_xset(&namespace, &name).await? else {
        info!("object deleted, discarding expectations");
        ctx.expectations.delete_expectations(&key);
        timer.success();
        return Ok(Action::await_change());
    };

    if let Err(err) = ensure_finalizer(&ctx, &live).await {
        timer.error("transient");
        return Err(err);
    }

    // shortcut until the informer cache reflects our prior writes
    if !ctx
        .expectations
        .satisfied(&key, ctx.cache_reader.as_ref())
        .await?
    {
        info!("cache not caught up, requeueing");
        metrics::record_expectation_requeue(&key);
        timer.success();
        return Ok(Action::requeue(EXPECTATION_REQUEUE));
    }

    let revisions = ctx
        .revision_manager
        .construct_revisions(&live)
        .await
        .map_err(|e| Error::revision_for(&key, e.to_string()))?;

    let mut new_status = ctx.controller.status(&live);
    new_status.current_revision = revisions
        .current
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    new_status.updated_revision = revisions
        .updated
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    new_status.collision_count = Some(revisions.collision_count);

    let mut sync_ctx = SyncContext {
        revisions: revisions.revisions,
        current_revision: revisions.current,
        updated_revision: revisions.updated,
        new_status,
    };

    let (requeue_after, sync_err) = do_sync(&ctx, &live, &mut sync_ctx).await;
    if let Some(err) = &sync_err {
        error!(error = %err, "failed to sync");
    }

    // write status regardless of sync outcome so operators see the latest
    // observed state
    sync_ctx.new_status = ctx.sync_control.calculate_status(&live, &sync_ctx).await;
    if let Err(status_err) = update_status(&ctx, &live, sync_ctx.new_status.clone()).await {
        timer.error("transient");
        return Err(Error::join(vec![Some(status_err), sync_err]).unwrap_or_else(|| {
            Error::internal_with_context("reconciler", "status update failed")
        }));
    }

    match sync_err {
        Some(err) => {
            timer.error(if err.is_retryable() { "transient" } else { "permanent" });
            Err(err)
        }
        None => {
            timer.success();
            Ok(requeue_action(requeue_after))
        }
    }
}

/// Error policy for the controller
///
/// Logs the failure and requeues with a flat backoff; per-key retry
/// escalation is left to the work queue.
pub fn error_policy<C, RA>(
    xset: Arc<C::XSet>,
    error: &Error,
    _ctx: Arc<XSetContext<C, RA>>,
) -> Action
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    error!(
        ?error,
        xset = %xset.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

fn requeue_action(requeue_after: Option<Duration>) -> Action {
    match requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

async fn do_sync<C, RA>(
    ctx: &XSetContext<C, RA>,
    xset: &C::XSet,
    sync_ctx: &mut SyncContext,
) -> (Option<Duration>, Option<Error>)
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    match ctx.sync_control.sync_targets(xset, sync_ctx).await {
        // writes were issued; end early and let the cache settle
        Ok(true) => return (None, None),
        Ok(false) => {}
        Err(err) => return (None, Some(err)),
    }

    match release_resources_for_deletion(ctx, xset, &mut sync_ctx.new_status).await {
        Ok(true) => return (None, None),
        Ok(false) => {}
        Err(err) => return (None, Some(err)),
    }

    if let Err(err) = ctx.sync_control.replace(xset, sync_ctx).await {
        return (None, Some(err));
    }

    let (scale_requeue, scale_err) = match ctx.sync_control.scale(xset, sync_ctx).await {
        Ok((_, requeue)) => (requeue, None),
        Err(err) => (None, Some(err)),
    };
    let (update_requeue, update_err) = match ctx.sync_control.update(xset, sync_ctx).await {
        Ok((_, requeue)) => (requeue, None),
        Err(err) => (None, Some(err)),
    };
    let patcher_err = ctx
        .sync_control
        .apply_template_patcher(xset, sync_ctx)
        .await
        .err();

    let err = Error::join(vec![scale_err, update_err, patcher_err]);
    let requeue = match (scale_requeue, update_requeue) {
        (Some(scale), Some(update)) => Some(scale.min(update)),
        (scale, update) => scale.or(update),
    };
    (requeue, err)
}

/// Finalizer protocol
///
/// While the parent lives, the finalizer is kept present. Once the parent
/// is deleting, the finalizer comes off only after a prior reconcile set
/// the `XSetTerminating` condition to `Deleted`.
async fn ensure_finalizer<C, RA>(ctx: &XSetContext<C, RA>, xset: &C::XSet) -> Result<()>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let finalizer = ctx.controller.finalizer_name();

    if xset.meta().deletion_timestamp.is_none() {
        if let Err(err) = ctx.client.add_finalizer(xset, finalizer).await {
            ctx.events
                .publish(
                    &xset.object_ref(&()),
                    EventType::Warning,
                    reasons::FAILED_ADD_FINALIZER,
                    actions::RECONCILE,
                    Some(format!("failed to add finalizer {finalizer}: {err}")),
                )
                .await;
            return Err(err);
        }
        return Ok(());
    }

    let status = ctx.controller.status(xset);
    let done = find_condition(&status, XSET_TERMINATING)
        .is_some_and(|cond| cond.status == "True" && cond.reason == teardown_reasons::DELETED);
    if done {
        if let Err(err) = ctx.client.remove_finalizer(xset, finalizer).await {
            ctx.events
                .publish(
                    &xset.object_ref(&()),
                    EventType::Warning,
                    reasons::FAILED_REMOVE_FINALIZER,
                    actions::DELETE,
                    Some(format!("failed to remove finalizer {finalizer}: {err}")),
                )
                .await;
            return Err(err);
        }
        info!(finalizer, "cleaned up finalizer");
    }
    Ok(())
}

/// Teardown orchestrator
///
/// Returns `true` when the parent is terminating and this reconcile must
/// not run the sync phase. Each stage records its outcome in the
/// `XSetTerminating` condition; the finalizer comes off in a later
/// reconcile once the condition reaches `Deleted`.
async fn release_resources_for_deletion<C, RA>(
    ctx: &XSetContext<C, RA>,
    xset: &C::XSet,
    new_status: &mut XSetStatus,
) -> Result<bool>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    if xset.meta().deletion_timestamp.is_none() {
        return Ok(false);
    }

    if let Err(err) = ensure_reclaim_target_sub_resources(ctx, xset).await {
        add_or_update_condition(
            new_status,
            XSET_TERMINATING,
            false,
            teardown_reasons::RECLAIM_SUB_RESOURCES_FAILED,
            &err.to_string(),
        );
        return Err(err);
    }

    if let Err(err) = ensure_reclaim_owner_references(ctx, xset).await {
        add_or_update_condition(
            new_status,
            XSET_TERMINATING,
            false,
            teardown_reasons::RECLAIM_OWNER_REFERENCES_FAILED,
            &err.to_string(),
        );
        return Err(err);
    }

    match ensure_reclaim_targets_deletion(ctx, xset).await {
        Err(err) => {
            add_or_update_condition(
                new_status,
                XSET_TERMINATING,
                false,
                teardown_reasons::RECLAIM_TARGETS_DELETION_FAILED,
                &err.to_string(),
            );
            return Err(err);
        }
        Ok(false) => {
            add_or_update_condition(
                new_status,
                XSET_TERMINATING,
                false,
                teardown_reasons::RECLAIMING_TARGETS_DELETION,
                "waiting for all targets to be deleted",
            );
            return Ok(true);
        }
        Ok(true) => {}
    }

    // every target is gone; release this parent's share of the ID pool
    if let Err(err) = ctx
        .resource_contexts
        .update_to_target_context(xset, &BTreeMap::new())
        .await
    {
        add_or_update_condition(
            new_status,
            XSET_TERMINATING,
            false,
            teardown_reasons::RECLAIM_RESOURCE_CONTEXT,
            &err.to_string(),
        );
        return Err(err);
    }

    add_or_update_condition(new_status, XSET_TERMINATING, true, teardown_reasons::DELETED, "");
    Ok(true)
}

/// Orphan retained PVCs so a successor set with the same template can
/// adopt them
async fn ensure_reclaim_target_sub_resources<C, RA>(
    ctx: &XSetContext<C, RA>,
    xset: &C::XSet,
) -> Result<()>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let Some(pvc_control) = &ctx.pvc_control else {
        return Ok(());
    };
    if !pvc_control.retain_pvc_when_xset_deleted(xset) {
        return Ok(());
    }

    let pvcs = pvc_control.filtered_pvcs(xset).await?;
    for pvc in &pvcs {
        let owned = pvc
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| !refs.is_empty());
        if owned {
            pvc_control.orphan_pvc(xset, pvc).await?;
        }
    }
    Ok(())
}

/// Strip decoration ownerReferences from every filtered target
async fn ensure_reclaim_owner_references<C, RA>(
    ctx: &XSetContext<C, RA>,
    xset: &C::XSet,
) -> Result<()>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let Some(decoration) = ctx.controller.decoration_adapter() else {
        return Ok(());
    };

    let spec = ctx.controller.spec(xset);
    let targets = ctx
        .target_control
        .filtered_targets(&spec.selector, xset)
        .await?;

    let decoration_kind = decoration.decoration_gvk().kind;
    for target in targets {
        let references = target.owner_references();
        if references.is_empty() {
            continue;
        }
        let kept: Vec<_> = references
            .iter()
            .filter(|reference| reference.kind != decoration_kind)
            .cloned()
            .collect();
        if kept.len() != references.len() {
            let mut updated = target.clone();
            updated.meta_mut().owner_references = Some(kept);
            ctx.target_control.update_target(&updated).await?;
        }
    }
    Ok(())
}

/// Drive target deletion; `true` once no filtered target remains
async fn ensure_reclaim_targets_deletion<C, RA>(
    ctx: &XSetContext<C, RA>,
    xset: &C::XSet,
) -> Result<bool>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let spec = ctx.controller.spec(xset);
    let targets = ctx
        .target_control
        .filtered_targets(&spec.selector, xset)
        .await?;
    if targets.is_empty() {
        return Ok(true);
    }

    for target in &targets {
        if target.meta().deletion_timestamp.is_none() {
            ctx.events
                .publish(
                    &xset.object_ref(&()),
                    EventType::Normal,
                    reasons::TARGETS_DELETED,
                    actions::DELETE,
                    Some(format!(
                        "waiting for targets to be deleted gracefully before {} is removed",
                        xset.name_any()
                    )),
                )
                .await;
            ctx.sync_control
                .batch_delete_targets_by_label(&targets)
                .await?;
            return Ok(false);
        }
    }

    // every target already carries a deletion timestamp; keep waiting
    warn!(
        targets = targets.len(),
        "targets still terminating before teardown can finish"
    );
    Ok(false)
}

async fn update_status<C, RA>(
    ctx: &XSetContext<C, RA>,
    xset: &C::XSet,
    status: XSetStatus,
) -> Result<()>
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let mut updated = xset.clone();
    ctx.controller.set_status(&mut updated, status);
    let written = ctx.client.update_status(&updated).await?;

    ctx.expectations.expect_update(
        &object_key(xset),
        ctx.controller.xset_gvk(),
        &xset.namespace().unwrap_or_default(),
        &xset.name_any(),
        &written.resource_version().unwrap_or_default(),
    );
    Ok(())
}
