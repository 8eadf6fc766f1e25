//! Monitoring counters and the periodic report task
//!
//! Counters live in an explicit shared context handed to every pipeline
//! stage; nothing in the loader keeps module-level mutable state. The
//! monitor task logs a sorted-JSON stats line at a fixed period, with
//! per-interval and lifetime rates, and warns when the worker pool has
//! lost half its members.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared pipeline counters.
pub struct Counters {
    start: Instant,
    pub received_messages: AtomicU64,
    pub queued_records: AtomicU64,
    pub processed_records: AtomicU64,
    pub failed_records: AtomicU64,
    pub retried_calls: AtomicU64,
    pub info_published: AtomicU64,
    pub failures_published: AtomicU64,
    pub active_workers: AtomicUsize,
}

impl Counters {
    pub fn new() -> Self {
        Counters {
            start: Instant::now(),
            received_messages: AtomicU64::new(0),
            queued_records: AtomicU64::new(0),
            processed_records: AtomicU64::new(0),
            failed_records: AtomicU64::new(0),
            retried_calls: AtomicU64::new(0),
            info_published: AtomicU64::new(0),
            failures_published: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic monitor task; runs until shutdown.
pub async fn run(
    counters: Arc<Counters>,
    workers_total: usize,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = time::interval(period);
    // The first tick fires immediately; skip it so the first report covers
    // a full period.
    interval.tick().await;

    let mut last_processed: u64 = 0;
    let mut last_queued: u64 = 0;
    let mut last_time = Instant::now();

    info!("monitor task started ({}s period)", period.as_secs());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let uptime = counters.uptime().as_secs().max(1);
        let elapsed = now.duration_since(last_time).as_secs().max(1);

        let processed = counters.processed_records.load(Ordering::Relaxed);
        let queued = counters.queued_records.load(Ordering::Relaxed);
        let processed_interval = processed - last_processed;
        let queued_interval = queued - last_queued;

        let active_workers = counters.active_workers.load(Ordering::Relaxed);
        if workers_total > 0 && active_workers * 2 < workers_total {
            warn!(
                "running low on workers: {active_workers} of {workers_total} alive; may need restart"
            );
        }

        let stats = json!({
            "failed_records_total": counters.failed_records.load(Ordering::Relaxed),
            "info_published_total": counters.info_published.load(Ordering::Relaxed),
            "failures_published_total": counters.failures_published.load(Ordering::Relaxed),
            "processed_records_interval": processed_interval,
            "processed_records_total": processed,
            "queued_records_interval": queued_interval,
            "queued_records_total": queued,
            "rate_processed_interval": processed_interval / elapsed,
            "rate_processed_total": processed / uptime,
            "rate_queued_interval": queued_interval / elapsed,
            "rate_queued_total": queued / uptime,
            "received_messages_total": counters.received_messages.load(Ordering::Relaxed),
            "retried_calls_total": counters.retried_calls.load(Ordering::Relaxed),
            "uptime": counters.uptime().as_secs(),
            "workers_active": active_workers,
            "workers_total": workers_total,
        });
        info!("monitor: {stats}");

        last_processed = processed;
        last_queued = queued;
        last_time = now;
    }
}
