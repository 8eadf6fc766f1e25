//! Kafka-like topic source
//!
//! The broker only accepts in-order commits of the lowest unacknowledged
//! offset per partition, while workers complete records in any order. This
//! adapter buffers out-of-order completions per partition and commits the
//! contiguous prefix as gaps close, so a commit never covers an offset whose
//! records are still outstanding.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use loader_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::transport::TopicWire;

use super::{AckToken, RawMessage, Received, Source};

/// Commit bookkeeping for one partition.
///
/// `next_commit` is the lowest offset not yet acknowledged; completions
/// above it wait in `done` until the gap below them closes.
struct PartitionState {
    next_commit: i64,
    done: BTreeSet<i64>,
}

/// Pull-style source over a partitioned topic with ordered commits.
pub struct TopicSource<W: TopicWire> {
    wire: W,
    poll_timeout: Duration,
    partitions: Mutex<HashMap<i32, PartitionState>>,
}

impl<W: TopicWire> TopicSource<W> {
    pub fn new(wire: W, poll_timeout: Duration) -> Self {
        TopicSource {
            wire,
            poll_timeout,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying wire client, for inspection after a run.
    pub fn wire(&self) -> &W {
        &self.wire
    }

    fn token_parts(message: &RawMessage) -> Result<(i32, i64)> {
        match message.token {
            AckToken::TopicOffset { partition, offset } => Ok((partition, offset)),
            ref other => Err(Error::Source(format!(
                "topic source handed a foreign ack token: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl<W: TopicWire> Source for TopicSource<W> {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn receive(&self) -> Result<Received> {
        let Some(delivery) = self.wire.poll(self.poll_timeout).await? else {
            return Ok(Received::Idle);
        };

        {
            let mut partitions = self.partitions.lock().await;
            partitions
                .entry(delivery.partition)
                .or_insert_with(|| PartitionState {
                    next_commit: delivery.offset,
                    done: BTreeSet::new(),
                });
        }

        Ok(Received::Message(RawMessage {
            id: Uuid::new_v4(),
            body: String::from_utf8_lossy(&delivery.payload).into_owned(),
            token: AckToken::TopicOffset {
                partition: delivery.partition,
                offset: delivery.offset,
            },
        }))
    }

    async fn ack(&self, message: &RawMessage) -> Result<()> {
        let (partition, offset) = Self::token_parts(message)?;

        // The lock is held across the commit so concurrent acks cannot
        // push the committed position backwards.
        let mut partitions = self.partitions.lock().await;
        let state = partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::Source(format!("ack for unknown partition {partition}")))?;

        state.done.insert(offset);
        let mut advanced = false;
        while state.done.remove(&state.next_commit) {
            state.next_commit += 1;
            advanced = true;
        }
        if advanced {
            let next_commit = state.next_commit;
            self.wire.commit(partition, next_commit).await?;
            debug!(partition, next_commit, "committed topic position");
        }
        Ok(())
    }

    async fn nack(&self, message: &RawMessage) -> Result<()> {
        let (partition, offset) = Self::token_parts(message)?;

        let mut partitions = self.partitions.lock().await;
        let state = partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::Source(format!("nack for unknown partition {partition}")))?;

        // Completions at or beyond the abandoned offset will be redelivered;
        // forget them so the rewound deliveries are tracked afresh.
        state.done.retain(|done| *done < offset);
        self.wire.seek(partition, offset).await?;
        debug!(partition, offset, "rewound topic position");
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.wire.heartbeat().await
    }
}
