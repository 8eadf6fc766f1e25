//! Per-message completion tracking
//!
//! A raw message is acknowledged to its backend if and only if every record
//! derived from it has reached a terminal outcome. The tracker owns each
//! message from codec expansion until the countdown hits zero, at which
//! point exactly one caller gets the message back to acknowledge it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::source::{MessageId, RawMessage};

struct Pending {
    message: RawMessage,
    remaining: usize,
}

/// Countdown registry keyed by message id.
#[derive(Default)]
pub struct CompletionTracker {
    pending: Mutex<HashMap<MessageId, Pending>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message expanded into `total` records.
    pub fn register(&self, message: RawMessage, total: usize) {
        assert!(total > 0, "a message always expands to at least one outcome");
        self.pending
            .lock()
            .unwrap()
            .insert(message.id, Pending { message, remaining: total });
    }

    /// Record one terminal outcome. Returns the message when this was its
    /// last outstanding record; the caller must acknowledge it.
    pub fn complete(&self, id: MessageId) -> Option<RawMessage> {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending
            .get_mut(&id)
            .expect("completion for a message that was never registered");
        entry.remaining -= 1;
        if entry.remaining == 0 {
            return pending.remove(&id).map(|p| p.message);
        }
        None
    }

    /// Messages still awaiting outcomes.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Take every incomplete message. Shutdown path: the dispatcher hands
    /// these back to the source as abandoned.
    pub fn drain_incomplete(&self) -> Vec<RawMessage> {
        self.pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, p)| p.message)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AckToken;
    use uuid::Uuid;

    fn message() -> RawMessage {
        RawMessage {
            id: Uuid::new_v4(),
            body: String::new(),
            token: AckToken::None,
        }
    }

    #[test]
    fn message_released_only_after_last_outcome() {
        let tracker = CompletionTracker::new();
        let msg = message();
        let id = msg.id;
        tracker.register(msg, 3);

        assert!(tracker.complete(id).is_none());
        assert!(tracker.complete(id).is_none());
        let released = tracker.complete(id).expect("last outcome releases");
        assert_eq!(released.id, id);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn single_record_message_releases_immediately() {
        let tracker = CompletionTracker::new();
        let msg = message();
        let id = msg.id;
        tracker.register(msg, 1);
        assert!(tracker.complete(id).is_some());
    }

    #[test]
    fn drain_returns_incomplete_messages() {
        let tracker = CompletionTracker::new();
        let partial = message();
        let untouched = message();
        let mut expected = vec![partial.id, untouched.id];
        tracker.register(partial, 2);
        tracker.register(untouched, 1);
        tracker.complete(expected[0]);

        let drained = tracker.drain_incomplete();
        let mut ids: Vec<MessageId> = drained.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        expected.sort_unstable();
        assert_eq!(ids, expected);
    }
}
