//! The adapter surface concrete set controllers implement
//!
//! The engine is generic over three resource types: the parent ("XSet"),
//! the child ("target"), and the ResourceContext sidecar. A concrete
//! controller binds them by implementing [`XSetController`] and
//! [`ResourceContextAdapter`]; optional capabilities (decoration watches,
//! PVC sub-resources) are modeled as accessor methods returning `None` by
//! default. Adapters are validated once at construction; see
//! [`crate::validation`].

use std::fmt::Debug;
use std::sync::Arc;

use kube::api::GroupVersionKind;
use kube::core::NamespaceResourceScope;
use kube::runtime::Controller;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{ContextKeys, ResourceContextSpec};
use crate::labels::{DefaultLabelManager, LabelAnnotationManager};
use crate::types::{XSetSpec, XSetStatus};

/// The group/version/kind of a statically typed resource
pub fn gvk_of<K>() -> GroupVersionKind
where
    K: Resource<DynamicType = ()>,
{
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Core adapter binding a concrete set controller to the engine
///
/// Implementations project their CRD types into the engine's spec/status
/// views. Projections are cheap clones of the consumed slice; the engine
/// never holds references into adapter-owned objects across awaits.
pub trait XSetController: Send + Sync + Sized + 'static {
    /// The parent custom resource type
    type XSet: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static;

    /// The managed child resource type
    type Target: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static;

    /// Name of this controller, used for work-queue and event attribution
    fn controller_name(&self) -> &str;

    /// Finalizer placed on parents to gate teardown
    fn finalizer_name(&self) -> &str;

    /// Project the slice of the parent spec the engine consumes
    fn spec(&self, xset: &Self::XSet) -> XSetSpec;

    /// Project the slice of the parent status the engine owns
    fn status(&self, xset: &Self::XSet) -> XSetStatus;

    /// Write the engine-owned status slice back into the parent
    ///
    /// Status fields outside the view must be preserved.
    fn set_status(&self, xset: &mut Self::XSet, status: XSetStatus);

    /// The label key mapping for this controller
    fn label_manager(&self) -> Arc<dyn LabelAnnotationManager> {
        Arc::new(DefaultLabelManager)
    }

    /// Decoration capability, when the controller overlays targets with a
    /// decoration resource
    fn decoration_adapter(&self) -> Option<&dyn DecorationAdapter<Self::XSet>> {
        None
    }

    /// Group/version/kind of the parent type
    fn xset_gvk(&self) -> GroupVersionKind {
        gvk_of::<Self::XSet>()
    }

    /// Group/version/kind of the target type
    fn target_gvk(&self) -> GroupVersionKind {
        gvk_of::<Self::Target>()
    }
}

/// Adapter for the ResourceContext sidecar type
pub trait ResourceContextAdapter: Send + Sync + 'static {
    /// The concrete sidecar resource type
    type ResourceContext: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static;

    /// Construct an empty sidecar object (metadata unset)
    fn new_resource_context(&self) -> Self::ResourceContext;

    /// Project the ID table out of a sidecar object
    fn spec(&self, obj: &Self::ResourceContext) -> ResourceContextSpec;

    /// Write the ID table back into a sidecar object
    fn set_spec(&self, obj: &mut Self::ResourceContext, spec: ResourceContextSpec);

    /// Key-table override for the context data bag
    ///
    /// `None` selects [`crate::context::default_context_keys`]. A `Some`
    /// table must cover every [`crate::context::ContextKey`] variant; this
    /// is checked at construction.
    fn context_keys(&self) -> Option<ContextKeys> {
        None
    }

    /// Group/version/kind of the sidecar type
    fn resource_context_gvk(&self) -> GroupVersionKind {
        gvk_of::<Self::ResourceContext>()
    }
}

/// Optional capability: a decoration resource overlaid on targets
pub trait DecorationAdapter<P>: Send + Sync
where
    P: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    /// Group/version/kind of the decoration resource.
    ///
    /// Teardown strips ownerReferences of this kind from targets before
    /// deleting them.
    fn decoration_gvk(&self) -> GroupVersionKind;

    /// Attach decoration watches to the controller stream
    ///
    /// The default attaches nothing; implementations map decoration events
    /// back to affected parents with their own trigger logic.
    fn attach_watch(&self, controller: Controller<P>) -> Controller<P> {
        controller
    }
}
