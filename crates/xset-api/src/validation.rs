//! Construction-time validation of the adapter surface
//!
//! A malformed adapter must stop the controller before the first reconcile
//! runs; every check here returns [`Error::Validation`], which is never
//! retryable.

use std::collections::HashSet;

use crate::adapter::{ResourceContextAdapter, XSetController};
use crate::context::{ContextKey, ContextKeys};
use crate::error::Error;
use crate::labels::{LabelAnnotationManager, LabelKey};
use crate::Result;

/// Validate an [`XSetController`] implementation
pub fn validate_xset_controller<C: XSetController>(controller: &C) -> Result<()> {
    if controller.controller_name().is_empty() {
        return Err(Error::validation("controller name must not be empty"));
    }
    if controller.finalizer_name().is_empty() {
        return Err(Error::validation_for(
            controller.controller_name(),
            "finalizer name must not be empty",
        ));
    }
    validate_label_mapping(controller.label_manager().as_ref(), controller.controller_name())
}

/// Validate a [`ResourceContextAdapter`] implementation
///
/// `None` (use the default key table) always passes.
pub fn validate_resource_context_adapter<RA: ResourceContextAdapter>(adapter: &RA) -> Result<()> {
    match adapter.context_keys() {
        Some(keys) => validate_context_key_table(&keys),
        None => Ok(()),
    }
}

/// Check a label mapping for empty or colliding keys
///
/// Two symbolic names resolving to the same concrete label would make the
/// instance-ID and replace-pair bookkeeping ambiguous.
pub fn validate_label_mapping(
    labels: &dyn LabelAnnotationManager,
    controller_name: &str,
) -> Result<()> {
    let keys = [
        LabelKey::InstanceId,
        LabelKey::ControlledBy,
        LabelKey::ReplacePairOrigin,
        LabelKey::RevisionHash,
    ];
    let mut seen = HashSet::new();
    for key in keys {
        let value = labels.value(key).to_string();
        if value.is_empty() {
            return Err(Error::validation_for(
                controller_name,
                format!("label mapping for {key:?} must not be empty"),
            ));
        }
        if !seen.insert(value.clone()) {
            return Err(Error::validation_for(
                controller_name,
                format!("label mapping for {key:?} duplicates {value}"),
            ));
        }
    }
    Ok(())
}

/// Check a custom context-key table for completeness and distinctness
///
/// The table must cover every [`ContextKey`] variant with non-empty,
/// pairwise-distinct values.
pub fn validate_context_key_table(keys: &ContextKeys) -> Result<()> {
    let mut seen = HashSet::new();
    for key in ContextKey::ALL {
        let Some(value) = keys.get(&key) else {
            return Err(Error::validation(format!(
                "context key table is missing {key:?}"
            )));
        };
        if value.is_empty() {
            return Err(Error::validation(format!(
                "context key table maps {key:?} to an empty string"
            )));
        }
        if !seen.insert(value.clone()) {
            return Err(Error::validation(format!(
                "context key table maps {key:?} to duplicate key {value}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::default_context_keys;
    use crate::labels::DefaultLabelManager;

    #[test]
    fn test_default_label_mapping_passes() {
        assert!(validate_label_mapping(&DefaultLabelManager, "test").is_ok());
    }

    #[test]
    fn test_colliding_label_mapping_is_rejected() {
        struct CollidingLabels;
        impl LabelAnnotationManager for CollidingLabels {
            fn value(&self, key: LabelKey) -> &str {
                match key {
                    LabelKey::RevisionHash => "controller-revision-hash",
                    _ => "same-key",
                }
            }
        }

        let err = validate_label_mapping(&CollidingLabels, "test").unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("duplicates"));
    }

    #[test]
    fn test_empty_label_value_is_rejected() {
        struct EmptyLabel;
        impl LabelAnnotationManager for EmptyLabel {
            fn value(&self, key: LabelKey) -> &str {
                match key {
                    LabelKey::InstanceId => "",
                    _ => "ok",
                }
            }
        }

        let err = validate_label_mapping(&EmptyLabel, "test").unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_default_context_key_table_passes() {
        assert!(validate_context_key_table(&default_context_keys()).is_ok());
    }

    #[test]
    fn test_missing_context_key_is_rejected() {
        let mut table = default_context_keys();
        table.remove(&ContextKey::RecreateUpdate);

        let err = validate_context_key_table(&table).unwrap_err();
        assert!(err.to_string().contains("RecreateUpdate"));
    }

    #[test]
    fn test_duplicate_context_key_is_rejected() {
        let mut table = default_context_keys();
        table.insert(ContextKey::Revision, "Owner".to_string());

        let err = validate_context_key_table(&table).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
