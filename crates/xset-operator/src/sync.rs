//! The sync-control seam
//!
//! Scale, replace, and update policy are supplied by the concrete
//! controller; the engine drives them in a fixed order and joins their
//! errors. [`SyncContext`] carries the revision pair and the in-progress
//! status through one reconcile.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;

use xset_api::adapter::XSetController;
use xset_api::types::XSetStatus;
use xset_api::Result;

/// Per-reconcile state shared between the engine and the sync control
#[derive(Clone, Debug)]
pub struct SyncContext {
    /// Full revision history, oldest first
    pub revisions: Vec<ControllerRevision>,
    /// The revision the set is rolling from
    pub current_revision: ControllerRevision,
    /// The revision the set is rolling to
    pub updated_revision: ControllerRevision,
    /// Status being assembled for this reconcile; written after sync
    pub new_status: XSetStatus,
}

impl SyncContext {
    /// Name of the current revision
    pub fn current_revision_name(&self) -> String {
        self.current_revision
            .metadata
            .name
            .clone()
            .unwrap_or_default()
    }

    /// Name of the updated revision
    pub fn updated_revision_name(&self) -> String {
        self.updated_revision
            .metadata
            .name
            .clone()
            .unwrap_or_default()
    }
}

/// Outcome of a scale or update pass
pub type SyncStepResult = Result<(bool, Option<Duration>)>;

/// The operations a concrete sync control implements
///
/// Step methods may requeue by returning a delay; the engine keeps the
/// smallest positive delay across steps. All step errors are joined and
/// surfaced together.
#[async_trait]
pub trait SyncControl<C: XSetController>: Send + Sync {
    /// Classify and reconcile the observed children
    ///
    /// Returns `true` when writes were performed and the reconcile should
    /// end early to let the cache settle.
    async fn sync_targets(&self, xset: &C::XSet, sync_ctx: &mut SyncContext) -> Result<bool>;

    /// Create successor targets for in-replace originals
    async fn replace(&self, xset: &C::XSet, sync_ctx: &mut SyncContext) -> Result<()>;

    /// Drive the target population toward the desired replica count
    async fn scale(&self, xset: &C::XSet, sync_ctx: &mut SyncContext) -> SyncStepResult;

    /// Drive the rolling update
    async fn update(&self, xset: &C::XSet, sync_ctx: &mut SyncContext) -> SyncStepResult;

    /// Post-sync template mutations over the reconciled targets
    async fn apply_template_patcher(
        &self,
        xset: &C::XSet,
        sync_ctx: &mut SyncContext,
    ) -> Result<()>;

    /// Recompute the parent status from observed state
    async fn calculate_status(&self, xset: &C::XSet, sync_ctx: &SyncContext) -> XSetStatus;

    /// Issue a batch delete over the given targets during teardown
    async fn batch_delete_targets_by_label(&self, targets: &[C::Target]) -> Result<()>;
}
