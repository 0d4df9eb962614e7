// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-destination outbound queues.
//!
//! An [`OutboundQueue`] holds the encoded records for one destination in
//! production order. Records that failed to send go back to the front so
//! ordering survives a retry.
//!
//! Queues can be bounded. When a bounded queue is full, the
//! [`OverflowPolicy`] decides between evicting the oldest record and refusing
//! the new one; either way the caller gets the displaced record back and is
//! expected to log it.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Logical output channel (topic name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    /// Create a destination.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&Destination> for Destination {
    fn from(dest: &Destination) -> Self {
        dest.clone()
    }
}

impl Borrow<str> for Destination {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A pending unit of work.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Destination the record belongs to.
    pub destination: Destination,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// When the record was first queued.
    pub enqueued_at: Instant,
    /// Failed send attempts so far.
    pub attempts: u32,
}

impl OutboundRecord {
    /// Create a record stamped with the current time.
    pub fn new(destination: Destination, payload: Vec<u8>) -> Self {
        Self {
            destination,
            payload,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }
}

/// What a full queue does with a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued record to make room.
    #[default]
    DropOldest,
    /// Refuse the new record.
    RejectNew,
}

/// Result of [`OutboundQueue::push_back`].
#[derive(Debug)]
pub enum PushOutcome {
    /// Queued without displacing anything.
    Queued,
    /// Queued; the returned oldest record was evicted.
    Evicted(OutboundRecord),
    /// Not queued; the record is handed back.
    Rejected(OutboundRecord),
}

/// FIFO of pending records for one destination.
#[derive(Debug)]
pub struct OutboundQueue {
    records: VecDeque<OutboundRecord>,
    capacity: Option<usize>,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self {
            records: VecDeque::new(),
            capacity: None,
            policy: OverflowPolicy::default(),
        }
    }

    /// Create a queue holding at most `capacity` records (`None` = unbounded).
    pub fn bounded(capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
            policy,
        }
    }

    /// Append a newly produced record.
    pub fn push_back(&mut self, record: OutboundRecord) -> PushOutcome {
        match self.capacity {
            Some(cap) if self.records.len() >= cap => match self.policy {
                OverflowPolicy::RejectNew => PushOutcome::Rejected(record),
                OverflowPolicy::DropOldest => match self.records.pop_front() {
                    Some(evicted) => {
                        self.records.push_back(record);
                        PushOutcome::Evicted(evicted)
                    }
                    // Zero capacity
                    None => PushOutcome::Rejected(record),
                },
            },
            _ => {
                self.records.push_back(record);
                PushOutcome::Queued
            }
        }
    }

    /// Put a record back at the head for retry.
    ///
    /// Ignores the capacity bound: a retried record is never displaced.
    pub fn push_front(&mut self, record: OutboundRecord) {
        self.records.push_front(record);
    }

    /// Take the oldest record.
    pub fn pop_front(&mut self) -> Option<OutboundRecord> {
        self.records.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Iterate records in send order.
    pub fn iter(&self) -> impl Iterator<Item = &OutboundRecord> {
        self.records.iter()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &str) -> OutboundRecord {
        OutboundRecord::new("t1".into(), payload.as_bytes().to_vec())
    }

    fn payloads(queue: &OutboundQueue) -> Vec<String> {
        queue
            .iter()
            .map(|r| String::from_utf8(r.payload.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::unbounded();
        assert!(queue.is_empty());

        queue.push_back(record("a"));
        queue.push_back(record("b"));
        queue.push_back(record("c"));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_front().unwrap().payload, b"a");
        assert_eq!(queue.pop_front().unwrap().payload, b"b");
        assert_eq!(queue.pop_front().unwrap().payload, b"c");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_push_front_retries_first() {
        let mut queue = OutboundQueue::unbounded();
        queue.push_back(record("r1"));
        queue.push_back(record("r2"));

        let r1 = queue.pop_front().unwrap();
        queue.push_front(r1);

        assert_eq!(payloads(&queue), vec!["r1", "r2"]);
    }

    #[test]
    fn test_drop_oldest() {
        let mut queue = OutboundQueue::bounded(Some(2), OverflowPolicy::DropOldest);
        assert!(matches!(queue.push_back(record("a")), PushOutcome::Queued));
        assert!(matches!(queue.push_back(record("b")), PushOutcome::Queued));

        match queue.push_back(record("c")) {
            PushOutcome::Evicted(evicted) => assert_eq!(evicted.payload, b"a"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(payloads(&queue), vec!["b", "c"]);
    }

    #[test]
    fn test_reject_new() {
        let mut queue = OutboundQueue::bounded(Some(1), OverflowPolicy::RejectNew);
        queue.push_back(record("a"));

        match queue.push_back(record("b")) {
            PushOutcome::Rejected(rejected) => assert_eq!(rejected.payload, b"b"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(payloads(&queue), vec!["a"]);
    }

    #[test]
    fn test_retry_ignores_bound() {
        let mut queue = OutboundQueue::bounded(Some(1), OverflowPolicy::RejectNew);
        queue.push_back(record("a"));
        queue.push_front(record("retry"));
        assert_eq!(payloads(&queue), vec!["retry", "a"]);
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let mut queue = OutboundQueue::bounded(Some(0), OverflowPolicy::DropOldest);
        assert!(matches!(
            queue.push_back(record("a")),
            PushOutcome::Rejected(_)
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_policy_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: OverflowPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"reject_new\"").unwrap();
        assert_eq!(w.policy, OverflowPolicy::RejectNew);
    }
}
