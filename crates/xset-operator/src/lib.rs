//! Generic Kubernetes set-controller engine
//!
//! The reusable core that concrete set controllers (a ReplicaSet-like, a
//! StatefulSet-like) plug into by supplying the adapters in `xset-api`.
//! The engine owns the hard, workload-agnostic parts:
//!
//! - stable instance-ID allocation persisted in a ResourceContext sidecar,
//!   including cross-owner ID pools ([`resource_context`])
//! - revision decision for newly born targets under the declared rollout
//!   strategy ([`resource_context`])
//! - a cache-expectation gate that holds reconciliation until the informer
//!   cache reflects prior writes ([`expectations`])
//! - finalizer-gated teardown releasing sub-resources, targets, and the ID
//!   pool in order ([`reconciler`])
//! - the reconcile state machine driving scale → replace → update → status
//!   convergence ([`reconciler`], [`runner`])
//!
//! Scale, replace, and update policy live behind the [`sync::SyncControl`]
//! seam; revision history behind [`revision::RevisionManager`]; PVC
//! sub-resources behind [`subresources::PvcControl`].

#![deny(missing_docs)]

pub mod expectations;
pub mod metrics;
pub mod reconciler;
pub mod resource_context;
pub mod revision;
pub mod runner;
pub mod subresources;
pub mod sync;
pub mod targets;

pub use reconciler::{error_policy, reconcile, XSetContext};
pub use resource_context::ResourceContextControl;
pub use runner::{run_controller, XSetContextBuilder};

// Re-export the adapter surface so downstream controllers depend on one crate.
pub use xset_api::{
    adapter, context, error, events, labels, types, validation, Error, Result,
};
