//! AMQP-like broker source
//!
//! The broker pushes deliveries and allows acknowledgment of any delivery
//! tag in any order, so no completion buffering is needed here; the adapter
//! is a thin translation between the push channel and the pull contract.

use std::time::Duration;

use async_trait::async_trait;
use loader_common::{Error, Result};
use uuid::Uuid;

use crate::transport::AmqpWire;

use super::{AckToken, RawMessage, Received, Source};

/// Pull-style source over a push-delivery AMQP channel.
pub struct AmqpSource<W: AmqpWire> {
    wire: W,
    wait: Duration,
}

impl<W: AmqpWire> AmqpSource<W> {
    pub fn new(wire: W, wait: Duration) -> Self {
        AmqpSource { wire, wait }
    }

    /// The underlying wire client, for inspection after a run.
    pub fn wire(&self) -> &W {
        &self.wire
    }

    fn delivery_tag(message: &RawMessage) -> Result<u64> {
        match message.token {
            AckToken::DeliveryTag(tag) => Ok(tag),
            ref other => Err(Error::Source(format!(
                "amqp source handed a foreign ack token: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl<W: AmqpWire> Source for AmqpSource<W> {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn receive(&self) -> Result<Received> {
        match self.wire.next_delivery(self.wait).await? {
            Some(delivery) => Ok(Received::Message(RawMessage {
                id: Uuid::new_v4(),
                body: String::from_utf8_lossy(&delivery.payload).into_owned(),
                token: AckToken::DeliveryTag(delivery.delivery_tag),
            })),
            None => Ok(Received::Idle),
        }
    }

    async fn ack(&self, message: &RawMessage) -> Result<()> {
        self.wire.ack(Self::delivery_tag(message)?).await
    }

    async fn nack(&self, message: &RawMessage) -> Result<()> {
        self.wire.nack(Self::delivery_tag(message)?).await
    }

    async fn heartbeat(&self) -> Result<()> {
        self.wire.heartbeat().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryAmqp;

    #[tokio::test]
    async fn ack_and_requeue() {
        let wire = MemoryAmqp::new();
        wire.push(r#"{"RECORD_ID":"1"}"#);
        wire.push(r#"{"RECORD_ID":"2"}"#);
        let source = AmqpSource::new(wire, Duration::from_millis(10));

        let Received::Message(first) = source.receive().await.unwrap() else {
            panic!("expected a message");
        };
        let Received::Message(second) = source.receive().await.unwrap() else {
            panic!("expected a message");
        };

        source.ack(&second).await.unwrap();
        source.nack(&first).await.unwrap();
        assert_eq!(source.wire.acked(), 1);
        assert_eq!(source.wire.requeued(), 1);

        // The abandoned message comes back under a fresh tag.
        let Received::Message(redelivered) = source.receive().await.unwrap() else {
            panic!("expected redelivery");
        };
        assert_eq!(redelivered.body, first.body);
        assert_ne!(redelivered.token, first.token);
    }
}
