//! Source adapters: one uniform pull contract over five broker delivery models
//!
//! Each backend reconciles its own delivery and acknowledgment model
//! (pull-with-manual-commit, push-with-consumer-ack, poll-with-visibility,
//! lease, pollable file) behind the same four operations. The dispatcher
//! never sees backend differences; it only sees messages, acks, and nacks.

use async_trait::async_trait;
use loader_common::Result;

pub mod kafka;
pub mod pubsub;
pub mod rabbitmq;
pub mod sqs;
pub mod url;

pub use kafka::TopicSource;
pub use pubsub::{LeaseSource, LeaseSourceConfig};
pub use rabbitmq::AmqpSource;
pub use sqs::{PtpQueueSource, PtpSourceConfig};
pub use url::UrlSource;

/// Identifier a source stamps on each delivery it hands out. Redelivery of
/// the same broker message gets a fresh id; tracking is per delivery.
pub type MessageId = uuid::Uuid;

/// Backend acknowledgment handle. Opaque to everything but the source
/// that issued it.
#[derive(Debug, Clone, PartialEq)]
pub enum AckToken {
    /// Partitioned-topic position.
    TopicOffset { partition: i32, offset: i64 },
    /// Broker delivery tag.
    DeliveryTag(u64),
    /// Point-to-point receipt handle.
    Receipt(String),
    /// Pub/sub lease identifier.
    Lease(String),
    /// Pollable inputs have nothing to acknowledge.
    None,
}

/// One broker-delivered unit, possibly containing multiple records.
///
/// Owned by its source until acknowledged or abandoned; the dispatcher
/// holds it only to hand it back.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub body: String,
    pub token: AckToken,
}

/// Result of one `receive` call.
#[derive(Debug)]
pub enum Received {
    Message(RawMessage),
    /// Nothing arrived within the backend's bounded wait.
    Idle,
    /// The input is exhausted and will never produce again.
    Closed,
}

/// Uniform pull-style contract the dispatcher consumes.
#[async_trait]
pub trait Source: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Pull the next message, blocking up to the backend's bounded wait.
    async fn receive(&self) -> Result<Received>;

    /// Commit a message. Once this returns, the backend must not redeliver
    /// the message to this consumer group.
    async fn ack(&self, message: &RawMessage) -> Result<()>;

    /// Abandon a message; it becomes eligible for redelivery under the
    /// backend's own policy.
    async fn nack(&self, message: &RawMessage) -> Result<()>;

    /// Keep the backend session alive while workers are busy elsewhere.
    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }
}
