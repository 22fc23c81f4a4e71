//! Watch source interface and an in-memory mirror implementation.
//!
//! A watch source keeps a local copy of a remote collection: an initial
//! list followed by incremental changes. It reports readiness through
//! [`WatchSource::has_synced`] and fans change notifications out to
//! registered [`ResourceEventHandler`]s.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use autopilot_reconcile::{key_for, Key, Resource};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Default period between full resyncs of the local mirror.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Errors reported by a watch source.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The initial list could not be fetched.
    #[error("initial list failed: {0}")]
    ListFailed(String),

    /// The change stream closed.
    #[error("watch stream disconnected")]
    Disconnected,

    /// The source returned without being asked to stop.
    #[error("watch source exited unexpectedly")]
    Exited,

    /// The source task panicked.
    #[error("watch source panicked: {0}")]
    Panicked(String),

    /// `run` was called more than once.
    #[error("watch source already started")]
    AlreadyStarted,
}

/// Payload of a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject<T> {
    /// The object as it was when the delete was observed.
    Final(Arc<T>),

    /// The delete was inferred from a relist; only the key is authoritative.
    Tombstone {
        key: Key,
        last_known: Option<Arc<T>>,
    },
}

/// Receives change notifications from a watch source.
///
/// Callbacks may run concurrently with each other and must not block.
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);

    fn on_update(&self, old: &T, new: &T);

    fn on_delete(&self, deleted: &DeletedObject<T>);
}

/// A locally synchronized mirror of a remote resource collection.
#[async_trait]
pub trait WatchSource: Send + Sync + 'static {
    /// Resource type held in the mirror.
    type Object: Resource + Send + Sync + 'static;

    /// Subscribe to change notifications. Must be called before `run`.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<Self::Object>>);

    /// Replicate until `stop` fires. Returning early is a failure.
    async fn run(&self, stop: watch::Receiver<bool>) -> Result<(), WatchError>;

    /// Returns true once the initial list has been delivered.
    fn has_synced(&self) -> bool;

    /// Look up the cached object for `key`.
    fn get(&self, key: &Key) -> Option<Arc<Self::Object>>;
}

/// A change to the remote collection.
#[derive(Debug)]
enum Change<T> {
    Apply(T),
    Delete(Key),
    Replace(Vec<T>),
}

/// Feeds remote changes into an [`InMemoryWatchSource`].
///
/// Dropping every feed disconnects the source.
#[derive(Debug, Clone)]
pub struct ChangeFeed<T> {
    tx: mpsc::UnboundedSender<Change<T>>,
}

impl<T> ChangeFeed<T> {
    /// Create or update an object.
    pub fn apply(&self, obj: T) -> Result<(), WatchError> {
        self.send(Change::Apply(obj))
    }

    /// Delete the object with `key`.
    pub fn delete(&self, key: Key) -> Result<(), WatchError> {
        self.send(Change::Delete(key))
    }

    /// Replace the whole collection, as after a relist. Cached objects
    /// missing from `objects` are deleted with a tombstone.
    pub fn replace(&self, objects: Vec<T>) -> Result<(), WatchError> {
        self.send(Change::Replace(objects))
    }

    fn send(&self, change: Change<T>) -> Result<(), WatchError> {
        self.tx.send(change).map_err(|_| WatchError::Disconnected)
    }
}

/// Watch source backed by an in-process map.
pub struct InMemoryWatchSource<T> {
    store: RwLock<HashMap<Key, Arc<T>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<T>>>>,
    initial: Mutex<Option<Vec<T>>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<Change<T>>>>,
    synced: AtomicBool,
    resync_interval: Duration,
}

impl<T> std::fmt::Debug for InMemoryWatchSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWatchSource")
            .field("synced", &self.synced.load(Ordering::Acquire))
            .field("resync_interval", &self.resync_interval)
            .finish_non_exhaustive()
    }
}

impl<T: Resource + Send + Sync + 'static> InMemoryWatchSource<T> {
    /// Create a source whose initial list is `initial`.
    ///
    /// A zero `resync_interval` disables periodic resync.
    pub fn new(initial: Vec<T>, resync_interval: Duration) -> (Self, ChangeFeed<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            store: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            initial: Mutex::new(Some(initial)),
            changes: Mutex::new(Some(rx)),
            synced: AtomicBool::new(false),
            resync_interval,
        };
        (source, ChangeFeed { tx })
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, obj: T) {
        let key = match key_for(&obj) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring object without a valid identity");
                return;
            }
        };

        let new = Arc::new(obj);
        let old = self
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&new));

        for handler in self.handlers() {
            match &old {
                Some(old) => handler.on_update(old, &new),
                None => handler.on_add(&new),
            }
        }
    }

    fn delete(&self, key: &Key) {
        let removed = self
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        let Some(obj) = removed else {
            debug!(key = %key, "Delete for unknown key ignored");
            return;
        };

        let deleted = DeletedObject::Final(obj);
        for handler in self.handlers() {
            handler.on_delete(&deleted);
        }
    }

    fn replace(&self, objects: Vec<T>) {
        let mut seen = HashSet::new();
        for obj in objects {
            if let Ok(key) = key_for(&obj) {
                seen.insert(key);
            }
            self.apply(obj);
        }

        let stale: Vec<(Key, Arc<T>)> = {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<Key> = store.keys().filter(|k| !seen.contains(*k)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| store.remove(&k).map(|obj| (k, obj)))
                .collect()
        };

        for (key, obj) in stale {
            debug!(key = %key, "Object vanished during relist");
            let deleted = DeletedObject::Tombstone {
                key,
                last_known: Some(obj),
            };
            for handler in self.handlers() {
                handler.on_delete(&deleted);
            }
        }
    }

    /// Re-deliver every cached object as an update.
    fn resync(&self) {
        let objects: Vec<Arc<T>> = self
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        debug!(count = objects.len(), "Resyncing cached objects");
        let handlers = self.handlers();
        for obj in &objects {
            for handler in &handlers {
                handler.on_update(obj, obj);
            }
        }
    }
}

#[async_trait]
impl<T: Resource + Send + Sync + 'static> WatchSource for InMemoryWatchSource<T> {
    type Object = T;

    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<T>>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    #[instrument(skip_all, name = "watch_source")]
    async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), WatchError> {
        let rx = self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            return Err(WatchError::AlreadyStarted);
        };

        let initial = self
            .initial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        let count = initial.len();
        self.replace(initial);
        self.synced.store(true, Ordering::Release);
        info!(objects = count, "Initial list delivered");

        let mut resync = (!self.resync_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                Instant::now() + self.resync_interval,
                self.resync_interval,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                change = rx.recv() => {
                    match change {
                        Some(Change::Apply(obj)) => self.apply(obj),
                        Some(Change::Delete(key)) => self.delete(&key),
                        Some(Change::Replace(objects)) => self.replace(objects),
                        None => {
                            warn!("Change feed closed");
                            return Err(WatchError::Disconnected);
                        }
                    }
                }
                _ = async {
                    match resync.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => self.resync(),
            }
        }

        debug!("Watch source stopped");
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get(&self, key: &Key) -> Option<Arc<T>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_reconcile::{DynamicObject, ObjectMeta};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Add(String),
        Update(String, String),
        Delete(String),
        Tombstone(String),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Seen>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn version(obj: &DynamicObject) -> String {
        obj.metadata.resource_version.clone().unwrap_or_default()
    }

    impl ResourceEventHandler<DynamicObject> for Recorder {
        fn on_add(&self, obj: &DynamicObject) {
            let name = obj.metadata.name.clone().unwrap();
            self.events.lock().unwrap().push(Seen::Add(name));
        }

        fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
            self.events
                .lock()
                .unwrap()
                .push(Seen::Update(version(old), version(new)));
        }

        fn on_delete(&self, deleted: &DeletedObject<DynamicObject>) {
            let seen = match deleted {
                DeletedObject::Final(obj) => Seen::Delete(obj.metadata.name.clone().unwrap()),
                DeletedObject::Tombstone { key, .. } => Seen::Tombstone(key.to_string()),
            };
            self.events.lock().unwrap().push(seen);
        }
    }

    fn pod(name: &str, rv: &str) -> DynamicObject {
        DynamicObject::new("Pod", ObjectMeta::namespaced("default", name)).with_resource_version(rv)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn start(
        source: Arc<InMemoryWatchSource<DynamicObject>>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<(), WatchError>>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { source.run(stop_rx).await });
        (stop_tx, handle)
    }

    #[tokio::test]
    async fn test_initial_list_then_synced() {
        let (source, _feed) =
            InMemoryWatchSource::new(vec![pod("a", "1"), pod("b", "1")], Duration::ZERO);
        let source = Arc::new(source);
        let recorder = Arc::new(Recorder::default());
        source.add_event_handler(recorder.clone());

        assert!(!source.has_synced());
        let (stop_tx, handle) = start(Arc::clone(&source));
        settle().await;

        assert!(source.has_synced());
        let mut events = recorder.take();
        events.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(events, vec![Seen::Add("a".into()), Seen::Add("b".into())]);

        stop_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_changes_dispatch_add_update_delete() {
        let (source, feed) = InMemoryWatchSource::new(Vec::new(), Duration::ZERO);
        let source = Arc::new(source);
        let recorder = Arc::new(Recorder::default());
        source.add_event_handler(recorder.clone());
        let (_stop_tx, _handle) = start(Arc::clone(&source));

        feed.apply(pod("a", "1")).unwrap();
        feed.apply(pod("a", "2")).unwrap();
        feed.delete(Key::new("Pod", Some("default"), "a").unwrap())
            .unwrap();
        feed.delete(Key::new("Pod", Some("default"), "ghost").unwrap())
            .unwrap();
        settle().await;

        assert_eq!(
            recorder.take(),
            vec![
                Seen::Add("a".into()),
                Seen::Update("1".into(), "2".into()),
                Seen::Delete("a".into()),
            ]
        );
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_replace_emits_tombstones() {
        let (source, feed) =
            InMemoryWatchSource::new(vec![pod("a", "1"), pod("b", "1")], Duration::ZERO);
        let source = Arc::new(source);
        let recorder = Arc::new(Recorder::default());
        source.add_event_handler(recorder.clone());
        let (_stop_tx, _handle) = start(Arc::clone(&source));
        settle().await;
        recorder.take();

        feed.replace(vec![pod("a", "2")]).unwrap();
        settle().await;

        assert_eq!(
            recorder.take(),
            vec![
                Seen::Update("1".into(), "2".into()),
                Seen::Tombstone("Pod/default/b".into()),
            ]
        );
        assert_eq!(source.len(), 1);
    }

    #[tokio::test]
    async fn test_object_without_identity_is_ignored() {
        let (source, feed) = InMemoryWatchSource::new(Vec::new(), Duration::ZERO);
        let source = Arc::new(source);
        let recorder = Arc::new(Recorder::default());
        source.add_event_handler(recorder.clone());
        let (_stop_tx, _handle) = start(Arc::clone(&source));

        feed.apply(DynamicObject::new("Pod", ObjectMeta::default()))
            .unwrap();
        settle().await;

        assert!(recorder.take().is_empty());
        assert!(source.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_redelivers_cached_objects() {
        let (source, _feed) =
            InMemoryWatchSource::new(vec![pod("a", "7")], Duration::from_secs(60));
        let source = Arc::new(source);
        let recorder = Arc::new(Recorder::default());
        source.add_event_handler(recorder.clone());
        let (_stop_tx, _handle) = start(Arc::clone(&source));
        settle().await;
        recorder.take();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(recorder.take(), vec![Seen::Update("7".into(), "7".into())]);
    }

    #[tokio::test]
    async fn test_closed_feed_is_a_disconnect() {
        let (source, feed) = InMemoryWatchSource::<DynamicObject>::new(Vec::new(), Duration::ZERO);
        let source = Arc::new(source);
        let (_stop_tx, handle) = start(Arc::clone(&source));
        drop(feed);

        assert!(matches!(handle.await.unwrap(), Err(WatchError::Disconnected)));
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (source, _feed) = InMemoryWatchSource::<DynamicObject>::new(Vec::new(), Duration::ZERO);
        let source = Arc::new(source);
        let (_stop_tx, _handle) = start(Arc::clone(&source));
        settle().await;

        let (_tx, rx) = watch::channel(false);
        assert!(matches!(source.run(rx).await, Err(WatchError::AlreadyStarted)));
    }
}
