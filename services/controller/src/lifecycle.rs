//! Process lifecycle: turn a termination request into an orderly stop.

use std::future::Future;
use std::sync::Arc;

use autopilot_reconcile::Reconciler;
use tokio::sync::watch;
use tracing::{error, info};

use crate::controller::{Controller, ControllerError};
use crate::watch::WatchSource;

/// Run `controller` until `shutdown` resolves, then stop it and wait for
/// it to reach `Stopped`.
///
/// Returns early if the controller exits on its own (for example because
/// the watch source failed to sync).
pub async fn run_until<S, R, F>(
    controller: Arc<Controller<S, R>>,
    shutdown: F,
) -> Result<(), ControllerError>
where
    S: WatchSource,
    R: Reconciler,
    F: Future<Output = ()>,
{
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(stop_rx).await }
    });

    tokio::select! {
        _ = shutdown => {
            info!(controller = controller.name(), "Termination requested, stopping controller");
        }
        result = &mut handle => {
            return result?;
        }
    }

    let _ = stop_tx.send(true);
    let result = handle.await?;
    info!(
        controller = controller.name(),
        state = ?controller.state(),
        "Controller exited"
    );
    result
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
