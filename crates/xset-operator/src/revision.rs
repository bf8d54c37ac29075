//! The revision-history seam
//!
//! Revision construction (hashing the template, deduplicating against
//! history, handling hash collisions) is owned by an external helper; the
//! engine only consumes the result.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;

use xset_api::adapter::XSetController;
use xset_api::Result;

/// The revision pair and history for one reconcile
#[derive(Clone, Debug)]
pub struct ConstructedRevisions {
    /// The revision the set is rolling from
    pub current: ControllerRevision,
    /// The revision the set is rolling to
    pub updated: ControllerRevision,
    /// Full history, oldest first
    pub revisions: Vec<ControllerRevision>,
    /// Hash-collision counter to persist in status
    pub collision_count: i32,
}

/// The revision-history helper the engine consumes
#[async_trait]
pub trait RevisionManager<C: XSetController>: Send + Sync {
    /// Build the current/updated revision pair for a parent
    async fn construct_revisions(&self, xset: &C::XSet) -> Result<ConstructedRevisions>;
}
