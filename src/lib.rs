//! Telemetry collector: producers send scalar readings over a local
//! request/reply channel; the server keeps a bounded window of recent
//! readings and periodically publishes count/avg/min/max into a POSIX
//! shared-memory region that other processes can read directly.

pub mod config;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod region;
pub mod server;
pub mod service;

use std::future::Future;
use std::io;

use log::{info, warn};
use tokio::sync::watch;

/// Resolves once the shutdown flag is set (or its sender is gone).
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Flip `stop` when `signal` fires, e.g. `tokio::signal::ctrl_c()`.
///
/// If the signal cannot be installed the server keeps running: `stop` is
/// held forever, since a dropped sender also reads as shutdown.
pub async fn stop_on_signal<F>(signal: F, stop: watch::Sender<bool>)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("interrupt received, shutting down");
            let _ = stop.send(true);
        }
        Err(e) => {
            warn!("cannot listen for interrupts: {e}; stop the server by other means");
            std::future::pending::<()>().await;
        }
    }
}
