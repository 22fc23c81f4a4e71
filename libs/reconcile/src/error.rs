//! Error types for key extraction and reconciliation.

use std::time::Duration;

use thiserror::Error;

/// Errors produced when a notification carries no usable identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The object has no kind.
    #[error("object has no kind")]
    MissingKind,

    /// The object has no name.
    #[error("{kind} object has no name")]
    MissingName { kind: String },

    /// A key segment is empty or contains the separator.
    #[error("invalid key segment {field}: {value:?}")]
    InvalidSegment { field: &'static str, value: String },

    /// A key string does not have the `kind/[namespace/]name` shape.
    #[error("malformed key: {0:?}")]
    Malformed(String),
}

/// Reconciliation errors.
///
/// Every variant is treated as a retryable failure by the controller.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// A resource the reconcile depends on does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// The reconcile task panicked.
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Returns true if this error came from a contained panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}
