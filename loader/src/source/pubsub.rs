//! Pub/sub lease source
//!
//! Messages are pulled under a lease that must be renewed while a record is
//! being processed. Ack completes the lease, nack abandons it back to the
//! subscription, and heartbeat renews every lease still in flight.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use loader_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::transport::{LeaseWire, LeasedDelivery};

use super::{AckToken, RawMessage, Received, Source};

/// Receive tuning for a leased pub/sub subscription.
#[derive(Debug, Clone)]
pub struct LeaseSourceConfig {
    /// Messages pulled per wire call.
    pub batch_size: usize,
    /// Wait per wire call.
    pub wait: Duration,
    /// Extension applied on each heartbeat renewal.
    pub lease_extension: Duration,
}

impl Default for LeaseSourceConfig {
    fn default() -> Self {
        LeaseSourceConfig {
            batch_size: 10,
            wait: Duration::from_secs(10),
            lease_extension: Duration::from_secs(60),
        }
    }
}

/// Pull-style source over a leased pub/sub subscription.
pub struct LeaseSource<W: LeaseWire> {
    wire: W,
    config: LeaseSourceConfig,
    buffered: Mutex<VecDeque<LeasedDelivery>>,
    in_flight: Mutex<HashSet<String>>,
}

impl<W: LeaseWire> LeaseSource<W> {
    pub fn new(wire: W, config: LeaseSourceConfig) -> Self {
        LeaseSource {
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

    fn lease(message: &RawMessage) -> Result<&str> {
        match message.token {
            AckToken::Lease(ref lease) => Ok(lease),
            ref other => Err(Error::Source(format!(
                "lease source handed a foreign ack token: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl<W: LeaseWire> Source for LeaseSource<W> {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn receive(&self) -> Result<Received> {
        let mut buffered = self.buffered.lock().await;
        if buffered.is_empty() {
            let batch = self
                .wire
                .pull(self.config.batch_size, self.config.wait)
                .await?;
            buffered.extend(batch);
        }

        match buffered.pop_front() {
            Some(delivery) => {
                self.in_flight.lock().await.insert(delivery.lease.clone());
                Ok(Received::Message(RawMessage {
                    id: Uuid::new_v4(),
                    body: String::from_utf8_lossy(&delivery.payload).into_owned(),
                    token: AckToken::Lease(delivery.lease),
                }))
            }
            None => Ok(Received::Idle),
        }
    }

    async fn ack(&self, message: &RawMessage) -> Result<()> {
        let lease = Self::lease(message)?;
        self.wire.complete(lease).await?;
        self.in_flight.lock().await.remove(lease);
        Ok(())
    }

    async fn nack(&self, message: &RawMessage) -> Result<()> {
        let lease = Self::lease(message)?;
        self.wire.abandon(lease).await?;
        self.in_flight.lock().await.remove(lease);
        Ok(())
    }

    /// Renew every lease still in flight.
    async fn heartbeat(&self) -> Result<()> {
        let leases: Vec<String> = self.in_flight.lock().await.iter().cloned().collect();
        for lease in leases {
            if let Err(err) = self.wire.renew(&lease, self.config.lease_extension).await {
                warn!("lease renewal failed for {lease}: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryLeaseQueue;

    #[tokio::test]
    async fn complete_and_abandon() {
        let wire = MemoryLeaseQueue::new(Duration::from_secs(30));
        wire.push(r#"{"RECORD_ID":"1"}"#);
        wire.push(r#"{"RECORD_ID":"2"}"#);
        let source = LeaseSource::new(
            wire,
            LeaseSourceConfig {
                batch_size: 10,
                wait: Duration::from_millis(10),
                lease_extension: Duration::from_secs(30),
            },
        );

        let Received::Message(first) = source.receive().await.unwrap() else {
            panic!("expected a message");
        };
        let Received::Message(second) = source.receive().await.unwrap() else {
            panic!("expected a message");
        };

        source.ack(&first).await.unwrap();
        assert_eq!(source.wire.completed(), 1);

        // Abandoned lease is redelivered on the next pull.
        source.nack(&second).await.unwrap();
        let Received::Message(redelivered) = source.receive().await.unwrap() else {
            panic!("expected redelivery");
        };
        assert_eq!(redelivered.body, second.body);
    }
}
