//! Autopilot controller
//!
//! Drives a set of resources toward their desired state by reconciling
//! keys pulled from a deduplicating, rate-limited work queue.
//!
//! ## Architecture
//!
//! - **Watch source**: keeps a local mirror and fans out change notifications
//! - **Event bridge**: turns notifications into queue keys
//! - **Controller**: waits for sync, runs workers, drains on shutdown
//! - **Lifecycle**: maps process signals onto a controller stop

pub mod bridge;
pub mod config;
pub mod controller;
pub mod lifecycle;
pub mod reconciler;
pub mod watch;

pub use bridge::EventBridge;
pub use config::Config;
pub use controller::{Controller, ControllerConfig, ControllerError, ControllerState};
pub use lifecycle::{run_until, shutdown_signal};
pub use reconciler::LoggingReconciler;
pub use watch::{
    ChangeFeed, DeletedObject, InMemoryWatchSource, ResourceEventHandler, WatchError, WatchSource,
};
