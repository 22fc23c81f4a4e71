//! Reconciliation loop primitives.
//!
//! This library provides the pieces a level-triggered controller is built
//! from:
//!
//! - **Keys**: stable identities derived from a resource's kind, namespace
//!   and name. Work is tracked per key, never per event.
//! - **Work queue**: coalesces repeated keys, hands each key to at most one
//!   worker at a time and parks failed keys behind a backoff.
//! - **Rate limiters**: per-key exponential backoff and an overall token
//!   bucket.
//!
//! # Invariants
//!
//! - A key is pending, processing or delayed, never more than one
//! - Reconciliation of one key is never concurrent with itself
//! - Retry history is only cleared by an explicit `forget`

mod error;
mod key;
mod queue;
mod rate_limiter;
mod resource;

use async_trait::async_trait;

pub use error::{KeyError, ReconcileError};
pub use key::{key_for, Key, KeyParts};
pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff,
    MaxOfRateLimiter, RateLimiter, RateLimiterConfig, DEFAULT_BACKOFF_FACTOR,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_RETRY_BURST, DEFAULT_RETRY_QPS,
};
pub use resource::{DynamicObject, ObjectMeta, Resource};

/// Business logic that converges one resource toward its desired state.
///
/// Implementations must:
///
/// - be idempotent: reconciling an unchanged key twice has no extra effect
/// - re-read current state by key rather than trust event payloads
/// - treat "object not found" as a completed deletion, not an error
///
/// The controller never calls `reconcile` concurrently for the same key but
/// does for different keys.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconcile the resource identified by `key`.
    async fn reconcile(&self, key: &Key) -> Result<(), ReconcileError>;
}
