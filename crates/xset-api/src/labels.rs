//! Symbolic label keys read on targets
//!
//! The engine reads a handful of labels off child objects: the instance-ID
//! label, the replace-pair-origin marker, the controlled-by marker used by
//! watch predicates, and the revision hash stamped by the revision manager.
//! Concrete controllers map the symbolic names to their own label keys by
//! implementing [`LabelAnnotationManager`]; [`DefaultLabelManager`] provides
//! the stock `xset.dev` keys.

/// Symbolic names for the labels the engine consumes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LabelKey {
    /// Stable instance ID of a target (stringified non-negative integer)
    InstanceId,
    /// Marks a target as managed by an XSet; watch predicates filter on it
    ControlledBy,
    /// Present on a replace successor, naming the origin target.
    /// Its presence excludes the target from unrecorded-ID ingestion.
    ReplacePairOrigin,
    /// Revision hash the target was created from
    RevisionHash,
}

/// Maps symbolic label names to concrete string keys
pub trait LabelAnnotationManager: Send + Sync {
    /// The concrete label key for a symbolic name
    fn value(&self, key: LabelKey) -> &str;
}

/// The stock label keys
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultLabelManager;

impl LabelAnnotationManager for DefaultLabelManager {
    fn value(&self, key: LabelKey) -> &str {
        match key {
            LabelKey::InstanceId => "xset.dev/instance-id",
            LabelKey::ControlledBy => "xset.dev/control",
            LabelKey::ReplacePairOrigin => "xset.dev/replace-pair-origin-name",
            LabelKey::RevisionHash => "controller-revision-hash",
        }
    }
}
