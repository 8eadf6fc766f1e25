//! # Stream Loader
//!
//! Consumes JSON records from interchangeable message-queue backends,
//! interprets per-record control directives, forwards each record to a
//! downstream entity-resolution engine, and routes the outcome to
//! secondary output queues. Five delivery models feed one worker pool
//! with uniform backpressure, bounded retries, and at-least-once
//! acknowledgment:
//! - a raw message is acknowledged only after every record derived from
//!   it reaches a terminal outcome;
//! - per-record failures never take the process down; fatal conditions
//!   drain the pool and exit with a category-specific status;
//! - a background heartbeat keeps broker sessions alive while workers
//!   sit in long engine calls.

pub mod dispatch;
pub mod engine;
pub mod governor;
pub mod heartbeat;
pub mod monitor;
pub mod sink;
pub mod source;
pub mod transport;

use std::sync::Arc;

use loader_common::Result;
use tokio::signal;
use tracing::info;

pub use dispatch::{DispatchConfig, Dispatcher};

/// Run a fully wired dispatcher to completion, with shutdown on Ctrl+C or
/// SIGTERM. Deployments that bind their own broker clients construct the
/// dispatcher over their source and call this.
pub async fn run_loader(dispatcher: Dispatcher) -> Result<()> {
    let dispatcher = Arc::new(dispatcher);
    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });
    dispatcher.run().await
}

/// Graceful shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
