//! Controller loop.
//!
//! The controller:
//! - Starts the watch source and waits for its initial sync
//! - Runs a fixed pool of workers that pull keys from the work queue
//! - Reports every reconcile outcome back to the queue
//! - Drains the queue on shutdown
//!
//! Lifecycle: `NotStarted → SyncingCache → Running → ShuttingDown → Stopped`.
//! A stop request during the sync wait goes straight to `Stopped` without
//! reconciling anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autopilot_reconcile::{Key, RateLimiterConfig, ReconcileError, Reconciler, WorkQueue};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::EventBridge;
use crate::watch::{WatchError, WatchSource};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default interval between readiness checks while waiting for sync.
pub const DEFAULT_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time allowed for the queue to drain before delayed keys are dropped.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// `run` has not been called.
    NotStarted,
    /// Waiting for the watch source's initial sync.
    SyncingCache,
    /// Workers are processing keys.
    Running,
    /// Draining the queue.
    ShuttingDown,
    /// All workers have exited.
    Stopped,
}

/// Errors that end a controller run.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The watch source failed before its initial sync completed.
    #[error("{controller}: failed to sync cache: {source}")]
    CacheSync {
        controller: String,
        source: WatchError,
    },

    /// The watch source failed while the controller was running.
    #[error("{controller}: watch source failed: {source}")]
    WatchSource {
        controller: String,
        source: WatchError,
    },

    /// `run` was called more than once.
    #[error("{0}: controller already started")]
    AlreadyStarted(String),

    /// The controller task panicked or was cancelled.
    #[error("controller task failed: {0}")]
    Join(#[from] JoinError),
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Interval between readiness checks while waiting for sync.
    pub sync_poll_interval: Duration,

    /// How long to wait for workers to drain before dropping delayed keys.
    /// `None` waits for every delayed key.
    pub drain_timeout: Option<Duration>,

    /// Retry policy for failed keys.
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            sync_poll_interval: DEFAULT_SYNC_POLL_INTERVAL,
            drain_timeout: Some(DEFAULT_DRAIN_TIMEOUT),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

enum SyncOutcome {
    Synced,
    Stopped,
    Failed(WatchError),
}

/// Level-triggered controller over one watch source.
pub struct Controller<S: WatchSource, R: Reconciler> {
    name: String,
    source: Arc<S>,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    state: watch::Sender<ControllerState>,
    started: AtomicBool,
}

impl<S: WatchSource, R: Reconciler> std::fmt::Debug for Controller<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: WatchSource, R: Reconciler> Controller<S, R> {
    /// Create a controller and subscribe its event bridge to `source`.
    pub fn new(
        name: impl Into<String>,
        source: Arc<S>,
        reconciler: Arc<R>,
        config: ControllerConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.rate_limiter.build()));
        source.add_event_handler(Arc::new(EventBridge::new(Arc::clone(&queue))));

        let (state, _) = watch::channel(ControllerState::NotStarted);

        Self {
            name: name.into(),
            source,
            reconciler,
            queue,
            config,
            state,
            started: AtomicBool::new(false),
        }
    }

    /// Controller name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// The work queue fed by the event bridge.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn set_state(&self, state: ControllerState) {
        debug!(controller = %self.name, ?state, "Controller state transition");
        self.state.send_replace(state);
    }

    /// Run until `stop` fires (or its sender is dropped).
    ///
    /// Returns an error if the watch source fails, before or after sync.
    #[instrument(skip_all, fields(controller = %self.name))]
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), ControllerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyStarted(self.name.clone()));
        }

        info!(workers = self.config.workers, "Starting controller");
        self.set_state(ControllerState::SyncingCache);

        let (source_stop_tx, source_stop_rx) = watch::channel(false);
        let mut source_task = tokio::spawn({
            let source = Arc::clone(&self.source);
            async move { source.run(source_stop_rx).await }
        });

        match self.wait_for_cache_sync(&mut stop, &mut source_task).await {
            SyncOutcome::Synced => {}
            SyncOutcome::Stopped => {
                info!("Stop requested before cache sync, exiting without processing");
                self.queue.shut_down();
                let _ = source_stop_tx.send(true);
                if let Err(e) = source_exit(source_task.await) {
                    debug!(error = %e, "Watch source exited with error during abort");
                }
                self.set_state(ControllerState::Stopped);
                return Ok(());
            }
            SyncOutcome::Failed(e) => {
                error!(error = %e, "Failed to sync cache");
                self.queue.shut_down();
                self.set_state(ControllerState::Stopped);
                return Err(ControllerError::CacheSync {
                    controller: self.name.clone(),
                    source: e,
                });
            }
        }

        info!("Cache synced, starting workers");
        self.set_state(ControllerState::Running);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers.max(1) {
            workers.spawn(run_worker(
                worker_id,
                Arc::clone(&self.queue),
                Arc::clone(&self.reconciler),
            ));
        }

        let source_failure = tokio::select! {
            _ = stop_requested(&mut stop) => {
                info!("Stop requested, shutting down");
                None
            }
            result = &mut source_task => {
                let e = source_exit(result).err().unwrap_or(WatchError::Exited);
                error!(error = %e, "Watch source exited while running");
                Some(e)
            }
        };

        self.set_state(ControllerState::ShuttingDown);
        self.queue.shut_down();
        let _ = source_stop_tx.send(true);

        if source_failure.is_none() {
            if let Err(e) = source_exit(source_task.await) {
                warn!(error = %e, "Watch source exited with error during shutdown");
            }
        }

        self.drain_workers(&mut workers).await;
        self.set_state(ControllerState::Stopped);
        info!("Controller stopped");

        match source_failure {
            Some(source) => Err(ControllerError::WatchSource {
                controller: self.name.clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    async fn wait_for_cache_sync(
        &self,
        stop: &mut watch::Receiver<bool>,
        source_task: &mut JoinHandle<Result<(), WatchError>>,
    ) -> SyncOutcome {
        let mut poll = tokio::time::interval(self.config.sync_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                return SyncOutcome::Stopped;
            }

            if self.source.has_synced() {
                return SyncOutcome::Synced;
            }

            tokio::select! {
                _ = stop_requested(stop) => return SyncOutcome::Stopped,
                result = &mut *source_task => {
                    let e = source_exit(result).err().unwrap_or(WatchError::Exited);
                    return SyncOutcome::Failed(e);
                }
                _ = poll.tick() => {}
            }
        }
    }

    async fn drain_workers(&self, workers: &mut JoinSet<()>) {
        let drained = match self.config.drain_timeout {
            Some(timeout) => tokio::time::timeout(timeout, join_all(workers))
                .await
                .is_ok(),
            None => {
                join_all(workers).await;
                true
            }
        };

        if !drained {
            let dropped = self.queue.drop_delayed();
            warn!(
                dropped,
                in_flight = self.queue.processing_len(),
                "Drain timeout elapsed, dropping delayed keys"
            );
            join_all(workers).await;
        }
    }
}

/// Resolves once `stop` is true. A dropped sender counts as a stop.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn source_exit(
    result: Result<Result<(), WatchError>, JoinError>,
) -> Result<(), WatchError> {
    match result {
        Ok(result) => result,
        Err(e) => Err(WatchError::Panicked(e.to_string())),
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Worker task failed");
        }
    }
}

/// Pull keys until the queue shuts down.
#[instrument(skip(queue, reconciler))]
async fn run_worker<R: Reconciler>(worker_id: usize, queue: Arc<WorkQueue>, reconciler: Arc<R>) {
    debug!("Worker started");

    while let Some(key) = queue.get().await {
        let result = reconcile_contained(&reconciler, &key).await;

        // Release the key first so a re-add during reconcile is flushed.
        queue.done(&key);

        match result {
            Ok(()) => {
                debug!(key = %key, "Reconciled");
                queue.forget(&key);
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    requeues = queue.num_requeues(&key),
                    "Reconcile failed, requeueing with backoff"
                );
                queue.add_rate_limited(key);
            }
        }
    }

    debug!("Worker exiting");
}

/// Run one reconcile in its own task so a panic fails only this key.
async fn reconcile_contained<R: Reconciler>(
    reconciler: &Arc<R>,
    key: &Key,
) -> Result<(), ReconcileError> {
    let task = tokio::spawn({
        let reconciler = Arc::clone(reconciler);
        let key = key.clone();
        async move { reconciler.reconcile(&key).await }
    });

    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(key = %key, error = %e, "Reconcile panicked");
            Err(ReconcileError::Panicked(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.sync_poll_interval, Duration::from_millis(100));
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.rate_limiter, RateLimiterConfig::default());
    }
}
