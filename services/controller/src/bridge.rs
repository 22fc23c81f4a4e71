//! Event bridge: watch notifications in, queue keys out.
//!
//! Only the identity travels through the queue. By the time a key is
//! reconciled the mirror may no longer hold the object, so deletes carry no
//! payload and the reconciler treats a missing object as a finished delete.

use std::sync::Arc;

use autopilot_reconcile::{key_for, Key, KeyError, Resource, WorkQueue};
use tracing::{trace, warn};

use crate::watch::{DeletedObject, ResourceEventHandler};

/// Translates add/update/delete notifications into [`WorkQueue::add`] calls.
#[derive(Debug, Clone)]
pub struct EventBridge {
    queue: Arc<WorkQueue>,
}

impl EventBridge {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    fn enqueue(&self, event: &'static str, key: Result<Key, KeyError>) {
        match key {
            Ok(key) => {
                trace!(event, key = %key, "Enqueueing key");
                self.queue.add(key);
            }
            Err(e) => {
                warn!(event, error = %e, "Dropping notification without a valid identity");
            }
        }
    }
}

impl<T: Resource + Send + Sync> ResourceEventHandler<T> for EventBridge {
    fn on_add(&self, obj: &T) {
        self.enqueue("add", key_for(obj));
    }

    fn on_update(&self, _old: &T, new: &T) {
        self.enqueue("update", key_for(new));
    }

    fn on_delete(&self, deleted: &DeletedObject<T>) {
        let key = match deleted {
            DeletedObject::Final(obj) => key_for(obj.as_ref()),
            DeletedObject::Tombstone { key, .. } => Ok(key.clone()),
        };
        self.enqueue("delete", key);
    }
}
