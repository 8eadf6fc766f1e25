//! Heartbeat coordinator
//!
//! An engine call can outlast a broker's session timeout by a wide margin,
//! so keep-alives cannot be left to the receive loop; this task pulses the
//! source on a fixed interval for as long as the loader runs. Backends
//! without a session concept inherit the no-op heartbeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::source::Source;

/// Pulse the source until shutdown.
pub async fn run(source: Arc<dyn Source>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;

    debug!(
        "heartbeat task started for {} ({}s interval)",
        source.name(),
        interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = source.heartbeat().await {
                    // A failed keep-alive is not fatal by itself; the broker
                    // will redeliver anything that times out.
                    warn!("heartbeat failed for {}: {err}", source.name());
                }
            }
        }
    }
}
