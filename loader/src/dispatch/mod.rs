//! Dispatcher and worker pool
//!
//! One intake loop pulls raw messages from the source, expands them through
//! the codec, and feeds records into a bounded queue; a fixed pool of
//! workers drains the queue and drives each record end to end: action
//! resolution, governor gate, engine call with bounded retries, outcome
//! routing, and finally the parent message's acknowledgment once its last
//! record is terminal. Backpressure is the queue itself: when it is full
//! the intake loop stops receiving.

mod tracker;

pub use tracker::CompletionTracker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use loader_common::record::{DATA_SOURCE_FIELD, RECORD_ID_FIELD};
use loader_common::{
    resolve_action, Action, DecodedRecord, Directive, Error, LoaderConfig, Outcome, Record,
    RecordCodec, Result,
};
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError};
use crate::governor::{Governor, GovernorDecision, NoopGovernor};
use crate::heartbeat;
use crate::monitor::{self, Counters};
use crate::sink::Sink;
use crate::source::{MessageId, RawMessage, Received, Source};

/// Dispatcher tuning and policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_depth: usize,
    pub workers: usize,
    /// Action applied when a record carries no directive.
    pub default_action: Action,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub randomize_backoff: bool,
    pub governor_fatal: bool,
    pub governor_delay_limit: Option<u32>,
    /// Consecutive receive failures tolerated before the source is
    /// declared broken.
    pub source_error_limit: u32,
    pub shutdown_grace: Duration,
    pub heartbeat_interval: Duration,
    pub monitoring_period: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig::from_loader(&LoaderConfig::default(), Action::Add)
    }
}

impl DispatchConfig {
    pub fn from_loader(config: &LoaderConfig, default_action: Action) -> Self {
        DispatchConfig {
            queue_depth: config.queue_depth,
            workers: config.threads_per_process,
            default_action,
            retry_limit: config.retry_limit,
            retry_backoff: config.retry_backoff,
            randomize_backoff: config.randomize_backoff,
            governor_fatal: config.governor_fatal,
            governor_delay_limit: config.governor_delay_limit,
            source_error_limit: 10,
            shutdown_grace: config.shutdown_grace,
            heartbeat_interval: config.heartbeat_interval,
            monitoring_period: config.monitoring_period,
        }
    }
}

/// One record's unit of work, from codec expansion to terminal outcome.
struct WorkItem {
    record: Record,
    directive: Option<Directive>,
    message_id: MessageId,
    seq_index: usize,
    seq_total: usize,
}

enum ItemResult {
    Processed,
    Failed,
    Fatal(Error),
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>;

/// The consumption-dispatch-acknowledgment engine.
pub struct Dispatcher {
    source: Arc<dyn Source>,
    engine: Arc<dyn Engine>,
    governor: Arc<dyn Governor>,
    info_sink: Option<Arc<dyn Sink>>,
    failure_sink: Option<Arc<dyn Sink>>,
    codec: RecordCodec,
    config: DispatchConfig,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    fatal: Mutex<Option<Error>>,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn Source>,
        engine: Arc<dyn Engine>,
        codec: RecordCodec,
        config: DispatchConfig,
    ) -> Self {
        Dispatcher {
            source,
            engine,
            governor: Arc::new(NoopGovernor),
            info_sink: None,
            failure_sink: None,
            codec,
            config,
            counters: Arc::new(Counters::new()),
            shutdown: CancellationToken::new(),
            fatal: Mutex::new(None),
        }
    }

    pub fn with_governor(mut self, governor: Arc<dyn Governor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_info_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.info_sink = Some(sink);
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Token that external signal handling cancels to request shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the input closes, shutdown is requested, or a fatal
    /// condition escalates. The returned error is the fatal condition.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<WorkItem>(self.config.queue_depth);
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let tracker = Arc::new(CompletionTracker::new());

        let background = self.shutdown.child_token();
        let heartbeat_task = tokio::spawn(heartbeat::run(
            Arc::clone(&self.source),
            self.config.heartbeat_interval,
            background.clone(),
        ));
        let monitor_task = tokio::spawn(monitor::run(
            Arc::clone(&self.counters),
            self.config.workers,
            self.config.monitoring_period,
            background.clone(),
        ));

        info!(
            "dispatcher started: {} workers, queue depth {}, source {}",
            self.config.workers,
            self.config.queue_depth,
            self.source.name()
        );

        let mut workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|worker_id| {
                tokio::spawn(Self::worker_loop(
                    Arc::clone(&self),
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&tracker),
                ))
            })
            .collect();

        // The intake loop owns the sender; when it returns, the channel
        // closes and the workers drain whatever is left.
        self.intake(tx, &tracker).await;

        let drained = tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join_all(workers.iter_mut()),
        )
        .await;
        if drained.is_err() {
            warn!(
                "shutdown grace of {:?} expired with records still in flight",
                self.config.shutdown_grace
            );
            for worker in &workers {
                worker.abort();
            }
        }

        background.cancel();
        let _ = heartbeat_task.await;
        let _ = monitor_task.await;

        // Whatever never finished goes back to the backend for redelivery.
        for message in tracker.drain_incomplete() {
            if let Err(err) = self.source.nack(&message).await {
                warn!("abandoning message {} failed: {err}", message.id);
            }
        }

        if let Some(err) = self.fatal.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    async fn intake(&self, tx: mpsc::Sender<WorkItem>, tracker: &Arc<CompletionTracker>) {
        let mut consecutive_errors: u32 = 0;
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.source.receive() => received,
            };

            match received {
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        "receive from {} failed ({consecutive_errors} in a row): {err}",
                        self.source.name()
                    );
                    if consecutive_errors >= self.config.source_error_limit {
                        self.escalate(Error::Source(format!(
                            "{} failed {consecutive_errors} consecutive receives: {err}",
                            self.source.name()
                        )));
                        break;
                    }
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Ok(Received::Idle) => {
                    consecutive_errors = 0;
                }
                Ok(Received::Closed) => {
                    info!("input exhausted; draining in-flight records");
                    break;
                }
                Ok(Received::Message(message)) => {
                    consecutive_errors = 0;
                    self.counters
                        .received_messages
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if !self.expand_and_enqueue(message, &tx, tracker).await {
                        break;
                    }
                }
            }
        }
    }

    /// Expand one message into work items. Returns false when the workers
    /// are gone and intake should stop.
    async fn expand_and_enqueue(
        &self,
        message: RawMessage,
        tx: &mpsc::Sender<WorkItem>,
        tracker: &Arc<CompletionTracker>,
    ) -> bool {
        let message_id = message.id;
        let body_excerpt = excerpt(&message.body);
        let decoded = self.codec.decode(&message.body);
        let total = decoded.len();
        debug!(message_id = %message_id, records = total, "expanded message");

        // An empty batch carries nothing to do; settle it right away.
        if total == 0 {
            if let Err(err) = self.source.ack(&message).await {
                warn!("ack failed for empty message {message_id}: {err}");
            }
            return true;
        }
        tracker.register(message, total);

        for (index, element) in decoded.into_iter().enumerate() {
            match element {
                Ok(DecodedRecord { record, directive }) => {
                    self.counters
                        .queued_records
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let item = WorkItem {
                        record,
                        directive,
                        message_id,
                        seq_index: index,
                        seq_total: total,
                    };
                    // Blocks when the queue is full: this is the
                    // backpressure point for the whole loader.
                    if tx.send(item).await.is_err() {
                        return false;
                    }
                }
                Err(err) => {
                    // Terminal before it ever queued: route it and count it
                    // toward the message's completion right here.
                    self.counters
                        .failed_records
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let context = json!({ "rawMessage": body_excerpt });
                    if let Err(fatal) = self.route_failure(&err, context).await {
                        self.escalate(fatal);
                        return false;
                    }
                    self.finish_one(tracker, message_id).await;
                }
            }
        }
        true
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: SharedReceiver,
        tracker: Arc<CompletionTracker>,
    ) {
        self.counters
            .active_workers
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("worker {worker_id} started");

        loop {
            if self.fatal_pending() {
                break;
            }
            let item = { rx.lock().await.recv().await };
            let Some(item) = item else { break };

            debug!(
                worker_id,
                message_id = %item.message_id,
                record = format!("{}/{}", item.seq_index + 1, item.seq_total),
                record_id = item.record.record_id(),
                "processing record"
            );

            match self.process_item(&item).await {
                ItemResult::Processed => {
                    self.counters
                        .processed_records
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                ItemResult::Failed => {
                    self.counters
                        .failed_records
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                ItemResult::Fatal(err) => {
                    // No terminal outcome: the parent message stays
                    // unacknowledged and will be redelivered after restart.
                    self.escalate(err);
                    break;
                }
            }

            self.finish_one(&tracker, item.message_id).await;
        }

        self.counters
            .active_workers
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        debug!("worker {worker_id} exited");
    }

    /// Count one terminal outcome and acknowledge the parent message when
    /// it was the last one outstanding.
    async fn finish_one(&self, tracker: &CompletionTracker, message_id: MessageId) {
        if let Some(parent) = tracker.complete(message_id) {
            match self.source.ack(&parent).await {
                Ok(()) => debug!(message_id = %message_id, "message acknowledged"),
                Err(err) => warn!(
                    "ack failed for message {message_id}: {err}; it may be redelivered"
                ),
            }
        }
    }

    async fn process_item(&self, item: &WorkItem) -> ItemResult {
        let action = resolve_action(item.directive.as_ref(), self.config.default_action);

        match self.clear_governor(&item.record).await {
            Ok(()) => {}
            Err(reason) => {
                let err = Error::GovernorVeto(reason);
                if self.config.governor_fatal {
                    return ItemResult::Fatal(err);
                }
                return self.fail_item(&err, item).await;
            }
        }

        let outcome = self.invoke_with_retry(action, item).await;
        self.route_outcome(outcome, item, action).await
    }

    /// Call the engine, absorbing transient failures up to the retry
    /// limit. The returned outcome is always terminal.
    async fn invoke_with_retry(&self, action: Action, item: &WorkItem) -> Outcome {
        let mut attempt: u32 = 0;
        loop {
            match self.engine.call(action, &item.record).await {
                Ok(info) => return Outcome::Success { info },
                Err(EngineError::Transient(detail)) => {
                    if attempt >= self.config.retry_limit {
                        return Outcome::Failure {
                            error: Error::EngineTransient(format!(
                                "gave up after {} attempts: {detail}",
                                attempt + 1
                            )),
                            retryable: false,
                        };
                    }
                    attempt += 1;
                    self.counters
                        .retried_calls
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let delay = self.backoff();
                    debug!(
                        record_id = item.record.record_id(),
                        attempt, "transient engine failure, retrying in {delay:?}: {detail}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(EngineError::Rejected(detail)) => {
                    return Outcome::Failure {
                        error: Error::EngineRejected(detail),
                        retryable: false,
                    };
                }
                Err(EngineError::Fatal(detail)) => {
                    return Outcome::Failure {
                        error: Error::EngineFatal(detail),
                        retryable: false,
                    };
                }
            }
        }
    }

    /// Deliver one terminal outcome: info payloads to the info sink,
    /// failures to the failure sink, fatal categories to escalation.
    async fn route_outcome(&self, outcome: Outcome, item: &WorkItem, action: Action) -> ItemResult {
        match outcome {
            Outcome::Success { info: Some(info) } => {
                match self.publish_info(info, &item.record, action).await {
                    Ok(()) => ItemResult::Processed,
                    Err(fatal) => ItemResult::Fatal(fatal),
                }
            }
            Outcome::Success { info: None } => ItemResult::Processed,
            Outcome::Failure {
                error: error @ Error::EngineFatal(_),
                ..
            } => ItemResult::Fatal(error),
            Outcome::Failure { error, .. } => self.fail_item(&error, item).await,
        }
    }

    /// Ask the governor until it lets the record through or refuses it.
    async fn clear_governor(&self, record: &Record) -> std::result::Result<(), String> {
        let mut delays: u32 = 0;
        loop {
            match self.governor.before_call(record).await {
                GovernorDecision::Proceed => return Ok(()),
                GovernorDecision::Delay(pause) => {
                    if let Some(limit) = self.config.governor_delay_limit {
                        if delays >= limit {
                            return Err(format!("governor delay limit of {limit} exceeded"));
                        }
                    }
                    delays += 1;
                    debug!("governor delay {delays}: pausing {pause:?}");
                    tokio::time::sleep(pause).await;
                }
                GovernorDecision::Veto(reason) => return Err(reason),
            }
        }
    }

    /// Route a non-retryable record failure; only a sink escalation turns
    /// this into a fatal result.
    async fn fail_item(&self, err: &Error, item: &WorkItem) -> ItemResult {
        warn!(
            record_id = item.record.record_id(),
            data_source = item.record.data_source(),
            "record failed terminally: {err}"
        );
        match self.route_failure(err, item.record.as_json()).await {
            Ok(()) => ItemResult::Failed,
            Err(fatal) => ItemResult::Fatal(fatal),
        }
    }

    /// Deliver a failed record to the failure sink, or drop it with a
    /// warning when none is configured.
    async fn route_failure(&self, err: &Error, record: Value) -> Result<()> {
        match &self.failure_sink {
            Some(sink) => {
                let payload = json!({
                    "error": err.to_string(),
                    "errorKind": err.kind(),
                    "record": record,
                });
                self.publish_with_retry(sink.as_ref(), &payload).await?;
                self.counters
                    .failures_published
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            None => {
                // Deliberate data-loss point: without a failure sink the
                // record survives only in this log line.
                warn!("no failure sink configured; dropping record after {err}: {record}");
                Ok(())
            }
        }
    }

    /// Augment and publish an info payload. The record is not done until
    /// this succeeds or the sink is disabled.
    async fn publish_info(&self, info: Value, record: &Record, action: Action) -> Result<()> {
        let Some(sink) = &self.info_sink else {
            debug!(
                record_id = record.record_id(),
                "info sink disabled; discarding info payload"
            );
            return Ok(());
        };

        let mut fields = match info {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("INFO".to_string(), other);
                fields
            }
        };
        fields
            .entry(DATA_SOURCE_FIELD.to_string())
            .or_insert_with(|| Value::String(record.data_source().to_string()));
        fields
            .entry(RECORD_ID_FIELD.to_string())
            .or_insert_with(|| Value::String(record.record_id().to_string()));
        fields.insert(
            "ACTION".to_string(),
            Value::String(action.wire_name().to_string()),
        );

        self.publish_with_retry(sink.as_ref(), &Value::Object(fields))
            .await?;
        self.counters
            .info_published
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Publish with the same bounded-retry policy as a transient engine
    /// call. Exhaustion is process-fatal: losing sink visibility is as
    /// serious as losing the record.
    async fn publish_with_retry(&self, sink: &dyn Sink, payload: &Value) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match sink.publish(payload).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.retry_limit => {
                    attempt += 1;
                    self.counters
                        .retried_calls
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(
                        "publish to {} sink failed (attempt {attempt}): {err}",
                        sink.name()
                    );
                    tokio::time::sleep(self.backoff()).await;
                }
                Err(err) => {
                    return Err(Error::SinkPublish(format!(
                        "{} sink still failing after {} retries: {err}",
                        sink.name(),
                        self.config.retry_limit
                    )));
                }
            }
        }
    }

    fn backoff(&self) -> Duration {
        let base = self.config.retry_backoff;
        if !self.config.randomize_backoff {
            return base;
        }
        let millis = (base.as_millis() as u64).max(1);
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis + millis / 2);
        Duration::from_millis(jittered)
    }

    fn escalate(&self, err: Error) {
        error!("fatal condition: {err}; draining and shutting down");
        {
            let mut fatal = self.fatal.lock().unwrap();
            // Only the first fatal condition decides the exit status.
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.shutdown.cancel();
    }

    fn fatal_pending(&self) -> bool {
        self.fatal.lock().unwrap().is_some()
    }
}

/// Trim a body for log lines and failure payloads.
fn excerpt(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    }
}
