//! Wire-client traits implemented by concrete broker bindings
//!
//! The adapters in [`crate::source`] own all acknowledgment and redelivery
//! reconciliation; these traits carry only what each protocol family
//! actually puts on the wire. A deployment binds its broker client library
//! by implementing the matching trait and handing the adapter to
//! [`crate::run_loader`]. The in-memory implementations in [`memory`] back
//! the test suite and the acceptance-test subcommand.

use std::time::Duration;

use async_trait::async_trait;
use loader_common::Result;

pub mod memory;

/// A record delivered from a partitioned topic.
#[derive(Debug, Clone)]
pub struct TopicDelivery {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Kafka-style consumer: pull, positional commit, seek.
#[async_trait]
pub trait TopicWire: Send + Sync {
    /// Pull one delivery, waiting at most `timeout`.
    async fn poll(&self, timeout: Duration) -> Result<Option<TopicDelivery>>;

    /// Commit the consumer position for a partition. `next_offset` is the
    /// lowest offset that has NOT been processed yet.
    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()>;

    /// Rewind a partition so delivery resumes at `offset`.
    async fn seek(&self, partition: i32, offset: i64) -> Result<()>;

    /// Consumer-group session keep-alive.
    async fn heartbeat(&self) -> Result<()>;
}

/// A delivery pushed by an AMQP-style broker.
#[derive(Debug, Clone)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

/// AMQP-style channel: push deliveries, per-tag acknowledgment.
#[async_trait]
pub trait AmqpWire: Send + Sync {
    /// Take the next buffered delivery, waiting at most `timeout`.
    async fn next_delivery(&self, timeout: Duration) -> Result<Option<AmqpDelivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject and requeue.
    async fn nack(&self, delivery_tag: u64) -> Result<()>;

    /// Connection keep-alive while no consumer is draining the channel.
    async fn heartbeat(&self) -> Result<()>;
}

/// A message received from a point-to-point queue.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub receipt: String,
    pub payload: Vec<u8>,
}

/// Point-to-point queue: batched receive with a visibility timeout.
#[async_trait]
pub trait PtpQueueWire: Send + Sync {
    /// Receive up to `max` messages, waiting at most `wait`. Received
    /// messages stay invisible to other consumers for `visibility`.
    async fn receive(
        &self,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<QueueDelivery>>;

    /// Remove a message permanently.
    async fn delete(&self, receipt: &str) -> Result<()>;

    /// Reset a message's visibility window; zero releases it immediately.
    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> Result<()>;
}

/// A message pulled under a lease from a pub/sub queue.
#[derive(Debug, Clone)]
pub struct LeasedDelivery {
    pub lease: String,
    pub payload: Vec<u8>,
}

/// Pub/sub subscription: leased pull with completion and renewal.
#[async_trait]
pub trait LeaseWire: Send + Sync {
    /// Pull up to `max` leased messages, waiting at most `wait`.
    async fn pull(&self, max: usize, wait: Duration) -> Result<Vec<LeasedDelivery>>;

    /// Settle a message; its lease is consumed.
    async fn complete(&self, lease: &str) -> Result<()>;

    /// Release a message back to the subscription.
    async fn abandon(&self, lease: &str) -> Result<()>;

    /// Extend an in-flight lease.
    async fn renew(&self, lease: &str, extension: Duration) -> Result<()>;
}

/// Outbound wire shared by info and failure sinks.
#[async_trait]
pub trait PublishWire: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<()>;
}

// A shared wire handle is a wire. Lets one client feed a source adapter
// while the owner keeps a handle for inspection or publishing.

#[async_trait]
impl<W: TopicWire + ?Sized> TopicWire for std::sync::Arc<W> {
    async fn poll(&self, timeout: Duration) -> Result<Option<TopicDelivery>> {
        (**self).poll(timeout).await
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()> {
        (**self).commit(partition, next_offset).await
    }

    async fn seek(&self, partition: i32, offset: i64) -> Result<()> {
        (**self).seek(partition, offset).await
    }

    async fn heartbeat(&self) -> Result<()> {
        (**self).heartbeat().await
    }
}

#[async_trait]
impl<W: AmqpWire + ?Sized> AmqpWire for std::sync::Arc<W> {
    async fn next_delivery(&self, timeout: Duration) -> Result<Option<AmqpDelivery>> {
        (**self).next_delivery(timeout).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        (**self).ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64) -> Result<()> {
        (**self).nack(delivery_tag).await
    }

    async fn heartbeat(&self) -> Result<()> {
        (**self).heartbeat().await
    }
}

#[async_trait]
impl<W: PtpQueueWire + ?Sized> PtpQueueWire for std::sync::Arc<W> {
    async fn receive(
        &self,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<QueueDelivery>> {
        (**self).receive(max, wait, visibility).await
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        (**self).delete(receipt).await
    }

    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> Result<()> {
        (**self).change_visibility(receipt, visibility).await
    }
}

#[async_trait]
impl<W: LeaseWire + ?Sized> LeaseWire for std::sync::Arc<W> {
    async fn pull(&self, max: usize, wait: Duration) -> Result<Vec<LeasedDelivery>> {
        (**self).pull(max, wait).await
    }

    async fn complete(&self, lease: &str) -> Result<()> {
        (**self).complete(lease).await
    }

    async fn abandon(&self, lease: &str) -> Result<()> {
        (**self).abandon(lease).await
    }

    async fn renew(&self, lease: &str, extension: Duration) -> Result<()> {
        (**self).renew(lease, extension).await
    }
}

#[async_trait]
impl<W: PublishWire + ?Sized> PublishWire for std::sync::Arc<W> {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        (**self).publish(payload).await
    }
}
