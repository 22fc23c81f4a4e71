//! Default reconciler: reports what it would manage.

use std::sync::Arc;

use async_trait::async_trait;
use autopilot_reconcile::{Key, ReconcileError, Reconciler, Resource};
use tracing::info;

use crate::watch::WatchSource;

/// Looks each key up in the watch source's mirror and logs it.
///
/// A key missing from the mirror is a completed delete and succeeds.
pub struct LoggingReconciler<S> {
    source: Arc<S>,
}

impl<S> LoggingReconciler<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: WatchSource> Reconciler for LoggingReconciler<S> {
    async fn reconcile(&self, key: &Key) -> Result<(), ReconcileError> {
        match self.source.get(key) {
            Some(obj) => {
                let meta = obj.meta();
                info!(
                    key = %key,
                    kind = obj.kind(),
                    resource_version = meta.resource_version.as_deref().unwrap_or(""),
                    "Managing resource"
                );
            }
            None => {
                info!(key = %key, "Resource no longer exists, nothing to manage");
            }
        }
        Ok(())
    }
}
