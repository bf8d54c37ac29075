//! The PVC sub-resource seam
//!
//! Set controllers that attach volumes to their targets supply a
//! [`PvcControl`]; teardown uses it to orphan retained claims before
//! targets are deleted. Controllers without volumes simply do not provide
//! one.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use xset_api::adapter::XSetController;
use xset_api::Result;

/// PVC operations the teardown orchestrator consumes
#[async_trait]
pub trait PvcControl<C: XSetController>: Send + Sync {
    /// Whether claims should outlive the parent
    ///
    /// When `true`, teardown strips the parent's ownerReference from every
    /// claim instead of letting garbage collection take them, so a
    /// replacement set with the same template can adopt them.
    fn retain_pvc_when_xset_deleted(&self, xset: &C::XSet) -> bool;

    /// List the claims still owned by the parent
    async fn filtered_pvcs(&self, xset: &C::XSet) -> Result<Vec<PersistentVolumeClaim>>;

    /// Remove the parent's ownerReference from a claim
    async fn orphan_pvc(&self, xset: &C::XSet, pvc: &PersistentVolumeClaim) -> Result<()>;
}
