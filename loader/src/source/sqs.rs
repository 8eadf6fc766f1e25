//! Point-to-point queue source
//!
//! The backend delivers batches under a visibility timeout: a received
//! message stays hidden from other consumers until it is deleted or its
//! window lapses. The adapter buffers the batch, deletes on ack, zeroes
//! visibility on nack, and extends visibility for every in-flight receipt
//! on heartbeat so slow engine calls do not trigger redelivery mid-flight.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use loader_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::transport::{PtpQueueWire, QueueDelivery};

use super::{AckToken, RawMessage, Received, Source};

/// Receive tuning for a point-to-point queue.
#[derive(Debug, Clone)]
pub struct PtpSourceConfig {
    /// Messages fetched per wire call.
    pub batch_size: usize,
    /// Long-poll wait per wire call.
    pub wait: Duration,
    /// Visibility window requested for received messages.
    pub visibility: Duration,
}

impl Default for PtpSourceConfig {
    fn default() -> Self {
        PtpSourceConfig {
            batch_size: 10,
            wait: Duration::from_secs(20),
            visibility: Duration::from_secs(300),
        }
    }
}

/// Pull-style source over a visibility-timeout queue.
pub struct PtpQueueSource<W: PtpQueueWire> {
    wire: W,
    config: PtpSourceConfig,
    buffered: Mutex<VecDeque<QueueDelivery>>,
    in_flight: Mutex<HashSet<String>>,
}

impl<W: PtpQueueWire> PtpQueueSource<W> {
    pub fn new(wire: W, config: PtpSourceConfig) -> Self {
        PtpQueueSource {
            wire,
            config,
            buffered: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying wire client, for inspection after a run.
    pub fn wire(&self) -> &W {
        &self.wire
    }

    fn receipt(message: &RawMessage) -> Result<&str> {
        match message.token {
            AckToken::Receipt(ref receipt) => Ok(receipt),
            ref other => Err(Error::Source(format!(
                "queue source handed a foreign ack token: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl<W: PtpQueueWire> Source for PtpQueueSource<W> {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn receive(&self) -> Result<Received> {
        let mut buffered = self.buffered.lock().await;
        if buffered.is_empty() {
            let batch = self
                .wire
                .receive(self.config.batch_size, self.config.wait, self.config.visibility)
                .await?;
            buffered.extend(batch);
        }

        match buffered.pop_front() {
            Some(delivery) => {
                self.in_flight.lock().await.insert(delivery.receipt.clone());
                Ok(Received::Message(RawMessage {
                    id: Uuid::new_v4(),
                    body: String::from_utf8_lossy(&delivery.payload).into_owned(),
                    token: AckToken::Receipt(delivery.receipt),
                }))
            }
            None => Ok(Received::Idle),
        }
    }

    async fn ack(&self, message: &RawMessage) -> Result<()> {
        let receipt = Self::receipt(message)?;
        self.wire.delete(receipt).await?;
        self.in_flight.lock().await.remove(receipt);
        Ok(())
    }

    async fn nack(&self, message: &RawMessage) -> Result<()> {
        let receipt = Self::receipt(message)?;
        self.wire
            .change_visibility(receipt, Duration::from_secs(0))
            .await?;
        self.in_flight.lock().await.remove(receipt);
        Ok(())
    }

    /// Extend the visibility window of everything in flight.
    async fn heartbeat(&self) -> Result<()> {
        let receipts: Vec<String> = self.in_flight.lock().await.iter().cloned().collect();
        for receipt in receipts {
            if let Err(err) = self
                .wire
                .change_visibility(&receipt, self.config.visibility)
                .await
            {
                // The message may have just been deleted by a worker; the
                // next heartbeat no longer carries it.
                warn!("visibility extension failed for {receipt}: {err}");
            }
        }
        Ok(())
    }
}
