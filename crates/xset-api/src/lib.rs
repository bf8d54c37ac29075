//! Adapter surface and shared types for the XSet controller engine
//!
//! An "XSet" is any declaratively-sized set of homogeneous child resources
//! ("targets") managed on behalf of a parent custom resource. This crate
//! defines everything a concrete set controller implements or consumes to
//! plug into the engine in `xset-operator`: the adapter traits, the
//! spec/status views the engine reads and writes, the ResourceContext ID
//! table, the symbolic label keys, and the shared error taxonomy.

#![deny(missing_docs)]

pub mod adapter;
pub mod context;
pub mod error;
pub mod events;
pub mod labels;
pub mod types;
pub mod validation;

pub use adapter::{gvk_of, DecorationAdapter, ResourceContextAdapter, XSetController};
pub use context::{default_context_keys, ContextDetail, ContextKey, ContextKeys, ResourceContextSpec};
pub use error::Error;
pub use labels::{DefaultLabelManager, LabelAnnotationManager, LabelKey};
pub use types::{
    ByLabel, ByPartition, RollingUpdate, ScaleStrategy, UpdateStrategy, XSetSpec, XSetStatus,
};

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, Error>;
