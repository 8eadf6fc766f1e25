//! In-memory wire implementations
//!
//! These back the integration tests and the acceptance-test subcommand with
//! faithful redelivery semantics: the topic retains its log so a seek
//! redelivers, the point-to-point queue honors visibility timeouts, and the
//! lease queue releases abandoned messages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loader_common::{Error, Result};

use super::{
    AmqpDelivery, AmqpWire, LeaseWire, LeasedDelivery, PtpQueueWire, PublishWire, QueueDelivery,
    TopicDelivery, TopicWire,
};

// ---------------------------------------------------------------------------
// Partitioned topic
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TopicState {
    /// Full retained log per partition; offset == index.
    log: HashMap<i32, Vec<Vec<u8>>>,
    /// Next offset to deliver per partition.
    cursor: HashMap<i32, usize>,
    /// Commit history, oldest first.
    commits: Vec<(i32, i64)>,
}

/// In-memory partitioned topic with positional commit and seek.
#[derive(Default)]
pub struct MemoryTopic {
    state: Mutex<TopicState>,
    heartbeats: AtomicU64,
}

impl MemoryTopic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, partition: i32, payload: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.log.entry(partition).or_default().push(payload.into());
    }

    /// Commit history, oldest first.
    pub fn commits(&self) -> Vec<(i32, i64)> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Latest committed position for a partition.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .rev()
            .find(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    fn try_poll(&self) -> Option<TopicDelivery> {
        let mut state = self.state.lock().unwrap();
        let partitions: Vec<i32> = state.log.keys().copied().collect();
        for partition in partitions {
            let next = *state.cursor.get(&partition).unwrap_or(&0);
            let available = state.log[&partition].len();
            if next < available {
                let payload = state.log[&partition][next].clone();
                state.cursor.insert(partition, next + 1);
                return Some(TopicDelivery {
                    partition,
                    offset: next as i64,
                    payload,
                });
            }
        }
        None
    }
}

#[async_trait]
impl TopicWire for MemoryTopic {
    async fn poll(&self, timeout: Duration) -> Result<Option<TopicDelivery>> {
        if let Some(delivery) = self.try_poll() {
            return Ok(Some(delivery));
        }
        tokio::time::sleep(timeout).await;
        Ok(self.try_poll())
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()> {
        self.state.lock().unwrap().commits.push((partition, next_offset));
        Ok(())
    }

    async fn seek(&self, partition: i32, offset: i64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .cursor
            .insert(partition, offset as usize);
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AMQP-style broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AmqpState {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
    acked: u64,
    requeued: u64,
}

/// In-memory push broker with per-delivery-tag acknowledgment.
#[derive(Default)]
pub struct MemoryAmqp {
    state: Mutex<AmqpState>,
    heartbeats: AtomicU64,
}

impl MemoryAmqp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().ready.push_back(payload.into());
    }

    pub fn acked(&self) -> u64 {
        self.state.lock().unwrap().acked
    }

    pub fn requeued(&self) -> u64 {
        self.state.lock().unwrap().requeued
    }

    fn take(&self) -> Option<AmqpDelivery> {
        let mut state = self.state.lock().unwrap();
        let payload = state.ready.pop_front()?;
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        state.unacked.insert(delivery_tag, payload.clone());
        Some(AmqpDelivery {
            delivery_tag,
            payload,
        })
    }
}

#[async_trait]
impl AmqpWire for MemoryAmqp {
    async fn next_delivery(&self, timeout: Duration) -> Result<Option<AmqpDelivery>> {
        if let Some(delivery) = self.take() {
            return Ok(Some(delivery));
        }
        tokio::time::sleep(timeout).await;
        Ok(self.take())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(Error::Source(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        }
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(payload) = state.unacked.remove(&delivery_tag) else {
            return Err(Error::Source(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        state.ready.push_front(payload);
        state.requeued += 1;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Point-to-point queue with visibility timeouts
// ---------------------------------------------------------------------------

struct QueueEntry {
    receipt: String,
    payload: Vec<u8>,
    visible_at: Instant,
    deleted: bool,
}

/// In-memory point-to-point queue honoring visibility timeouts.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<QueueEntry>>,
    next_receipt: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(QueueEntry {
            receipt: format!("receipt-{receipt}"),
            payload: payload.into(),
            visible_at: Instant::now(),
            deleted: false,
        });
    }

    /// Messages neither deleted nor currently invisible.
    pub fn visible(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !e.deleted && e.visible_at <= now)
            .count()
    }

    pub fn deleted(&self) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| e.deleted).count()
    }

    fn take_visible(&self, max: usize, visibility: Duration) -> Vec<QueueDelivery> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let mut taken = Vec::new();
        for entry in entries.iter_mut() {
            if taken.len() >= max {
                break;
            }
            if !entry.deleted && entry.visible_at <= now {
                entry.visible_at = now + visibility;
                taken.push(QueueDelivery {
                    receipt: entry.receipt.clone(),
                    payload: entry.payload.clone(),
                });
            }
        }
        taken
    }
}

#[async_trait]
impl PtpQueueWire for MemoryQueue {
    async fn receive(
        &self,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<QueueDelivery>> {
        let taken = self.take_visible(max, visibility);
        if !taken.is_empty() {
            return Ok(taken);
        }
        tokio::time::sleep(wait).await;
        Ok(self.take_visible(max, visibility))
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.receipt == receipt && !e.deleted) {
            Some(entry) => {
                entry.deleted = true;
                Ok(())
            }
            None => Err(Error::Source(format!("unknown receipt {receipt}"))),
        }
    }

    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.receipt == receipt && !e.deleted) {
            Some(entry) => {
                entry.visible_at = Instant::now() + visibility;
                Ok(())
            }
            None => Err(Error::Source(format!("unknown receipt {receipt}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Leased pub/sub queue
// ---------------------------------------------------------------------------

struct LeaseEntry {
    lease: String,
    payload: Vec<u8>,
    leased_until: Option<Instant>,
    completed: bool,
}

/// In-memory pub/sub queue with leases.
pub struct MemoryLeaseQueue {
    entries: Mutex<Vec<LeaseEntry>>,
    lease_period: Duration,
    next_lease: AtomicU64,
}

impl MemoryLeaseQueue {
    pub fn new(lease_period: Duration) -> Self {
        MemoryLeaseQueue {
            entries: Mutex::new(Vec::new()),
            lease_period,
            next_lease: AtomicU64::new(0),
        }
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(LeaseEntry {
            lease: format!("lease-{lease}"),
            payload: payload.into(),
            leased_until: None,
            completed: false,
        });
    }

    pub fn completed(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.completed)
            .count()
    }

    fn take_available(&self, max: usize) -> Vec<LeasedDelivery> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let mut taken = Vec::new();
        for entry in entries.iter_mut() {
            if taken.len() >= max {
                break;
            }
            let leased = entry.leased_until.map(|t| t > now).unwrap_or(false);
            if !entry.completed && !leased {
                entry.leased_until = Some(now + self.lease_period);
                taken.push(LeasedDelivery {
                    lease: entry.lease.clone(),
                    payload: entry.payload.clone(),
                });
            }
        }
        taken
    }
}

#[async_trait]
impl LeaseWire for MemoryLeaseQueue {
    async fn pull(&self, max: usize, wait: Duration) -> Result<Vec<LeasedDelivery>> {
        let taken = self.take_available(max);
        if !taken.is_empty() {
            return Ok(taken);
        }
        tokio::time::sleep(wait).await;
        Ok(self.take_available(max))
    }

    async fn complete(&self, lease: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.lease == lease && !e.completed) {
            Some(entry) => {
                entry.completed = true;
                Ok(())
            }
            None => Err(Error::Source(format!("unknown lease {lease}"))),
        }
    }

    async fn abandon(&self, lease: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.lease == lease && !e.completed) {
            Some(entry) => {
                entry.leased_until = None;
                Ok(())
            }
            None => Err(Error::Source(format!("unknown lease {lease}"))),
        }
    }

    async fn renew(&self, lease: &str, extension: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.lease == lease && !e.completed) {
            Some(entry) => {
                entry.leased_until = Some(Instant::now() + extension);
                Ok(())
            }
            None => Err(Error::Source(format!("unknown lease {lease}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Publish wire
// ---------------------------------------------------------------------------

/// Records published payloads; can be scripted to fail.
#[derive(Default)]
pub struct MemoryPublish {
    published: Mutex<Vec<Vec<u8>>>,
    fail_remaining: AtomicU64,
}

impl MemoryPublish {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publish calls fail.
    pub fn fail_next(&self, count: u64) {
        self.fail_remaining.store(count, Ordering::Relaxed);
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_json(&self) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }
}

#[async_trait]
impl PublishWire for MemoryPublish {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let remaining = self.fail_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::Relaxed);
            return Err(Error::Source("scripted publish failure".to_string()));
        }
        self.published.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}
