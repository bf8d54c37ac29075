//! Error types for the XSet controller engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like the owning XSet name
//! or the engine component that failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for XSet engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for adapters or specs
    ///
    /// Raised at controller construction time when the adapter surface is
    /// incomplete, or during reconciliation when a spec field is unusable.
    /// Never retryable: the adapter or spec must change.
    #[error("validation error for {controller}: {message}")]
    Validation {
        /// Name of the controller with the invalid configuration
        controller: String,
        /// Description of what's invalid
        message: String,
    },

    /// Revision construction error
    ///
    /// The external revision manager failed to build the current/updated
    /// revision pair for a parent object.
    #[error("revision error for {xset}: {message}")]
    Revision {
        /// Name of the XSet whose revisions could not be constructed
        xset: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Engine component where the error occurred (e.g. "allocator", "reconciler")
        context: String,
    },

    /// Several sync sub-steps failed in the same reconcile
    ///
    /// All member errors are surfaced; none are masked.
    #[error("{}", join_messages(.errors))]
    Aggregate {
        /// The joined errors, in sub-step order
        errors: Vec<Error>,
    },
}

fn join_messages(errors: &[Error]) -> String {
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} sync errors: [{joined}]", errors.len())
}

impl Error {
    /// Create a validation error without controller context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            controller: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with controller context
    pub fn validation_for(controller: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            controller: controller.into(),
            message: msg.into(),
        }
    }

    /// Create a revision construction error
    pub fn revision_for(xset: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Revision {
            xset: xset.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with component context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Join several optional errors into at most one
    ///
    /// `None` members are dropped and nested aggregates are flattened.
    /// Returns `None` when nothing failed, the sole error when exactly one
    /// did, and an [`Error::Aggregate`] otherwise.
    pub fn join(errors: Vec<Option<Error>>) -> Option<Error> {
        let mut flat = Vec::new();
        for err in errors.into_iter().flatten() {
            match err {
                Error::Aggregate { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate { errors: flat }),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors are not retryable (require adapter/spec fixes).
    /// Kubernetes errors depend on the status code: 4xx responses are
    /// permanent except request-timeout, conflict, and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => {
                    matches!(ae.code, 408 | 409 | 429)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Revision { .. } => true,
            Error::Internal { .. } => true,
            Error::Aggregate { errors } => errors.iter().any(Error::is_retryable),
        }
    }

    /// The engine component context, if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Check whether a Kubernetes API error is a 404 NotFound
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Check whether a Kubernetes API error is a 409 Conflict
///
/// Conflicts surface from optimistic-concurrency writes against a stale
/// `resourceVersion` and are resolved by the outer reconcile retry.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
