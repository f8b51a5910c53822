//! Priority-ordered buffer of admitted updates

use crate::types::SubscriptionId;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tokio::time::Instant;
use uuid::Uuid;

/// An admitted update waiting for dispatch
#[derive(Debug, Clone)]
pub struct UpdateQueueEntry {
    pub id: Uuid,
    pub feed: String,
    pub payload: Value,
    pub timestamp: Instant,
    pub received_at: DateTime<Utc>,
    /// Insertion order, breaks timestamp ties
    pub sequence: u64,
    pub priority: u8,
    /// Subscriptions interested at admission time
    pub subscribers: HashSet<SubscriptionId>,
    /// Subscriptions whose own fetch produced the payload
    pub origins: HashSet<SubscriptionId>,
}

impl UpdateQueueEntry {
    pub fn new(
        feed: &str,
        payload: Value,
        priority: u8,
        subscribers: HashSet<SubscriptionId>,
        timestamp: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            feed: feed.to_string(),
            payload,
            timestamp,
            received_at: Utc::now(),
            sequence: 0,
            priority,
            subscribers,
            origins: HashSet::new(),
        }
    }

    /// Marks subscriptions that receive the payload regardless of filter
    pub fn with_origins(mut self, origins: HashSet<SubscriptionId>) -> Self {
        self.origins = origins;
        self
    }

    /// Whether this entry was written after `other`
    pub fn is_newer_than(&self, other: &Self) -> bool {
        (self.timestamp, self.sequence) > (other.timestamp, other.sequence)
    }
}

/// Queue kept sorted by priority, FIFO among equal priorities
///
/// No deduplication happens here; the dispatcher folds entries for the same
/// feed when it drains a batch.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    entries: VecDeque<UpdateQueueEntry>,
    next_sequence: u64,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts before the first entry of strictly lower priority
    pub fn insert(&mut self, mut entry: UpdateQueueEntry) {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;

        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority < entry.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
    }

    pub fn dequeue_one(&mut self) -> Option<UpdateQueueEntry> {
        self.entries.pop_front()
    }

    pub fn dequeue_up_to(&mut self, n: usize) -> Vec<UpdateQueueEntry> {
        let take = n.min(self.entries.len());
        self.entries.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards every entry, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
