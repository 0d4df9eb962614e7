// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer pool.
//!
//! [`ProducerPool`] is what callers publish through. `produce()` encodes the
//! value, appends it to the destination's queue and returns; it never waits
//! on the network. Delivery happens on a background drain task that runs
//! only while the [`ConnectionSupervisor`] reports a connection.
//!
//! # Delivery
//!
//! ```text
//! produce() -> encode -> OutboundQueue[dest] --(drain task)--> BrokerClient::publish
//!                                ^                                 |
//!                                +---- front requeue on outage ----+
//! ```
//!
//! - Records of one destination are sent in production order. A record that
//!   failed because the broker went away is requeued at the front, the
//!   connection is reset and the drain stops.
//! - Any other send error drops that one record.
//! - A send whose acknowledgement is lost may be repeated after reconnect:
//!   delivery is at-least-once.
//!
//! A watcher task reacts to connection state: on connect it starts a drain,
//! on disconnect with records pending it retries with exponential backoff.

use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::encoder::{MessageEncoder, OutboundValue};
use crate::error::TransportError;
use crate::queue::{Destination, OutboundQueue, OutboundRecord, OverflowPolicy, PushOutcome};
use crate::schema::Schema;
use crate::transport::BrokerClient;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tuning knobs for a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Limit for one connection attempt.
    pub connect_timeout: Duration,
    /// Limit for one publish; expiry counts as broker unavailable.
    pub send_timeout: Duration,
    /// Per-destination queue bound (`None` = unbounded).
    pub max_pending: Option<usize>,
    /// What a full queue does.
    pub overflow: OverflowPolicy,
    /// First reconnect delay; zero disables automatic reconnects.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            max_pending: Some(10_000),
            overflow: OverflowPolicy::DropOldest,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// `produce()` calls.
    pub produced: AtomicU64,
    /// Values dropped because encoding failed.
    pub encode_failures: AtomicU64,
    /// Send attempts.
    pub attempted: AtomicU64,
    /// Records acknowledged by the broker.
    pub sent: AtomicU64,
    /// Records put back after a transport outage.
    pub requeued: AtomicU64,
    /// Records dropped after a permanent send error.
    pub dropped: AtomicU64,
    /// Records evicted from a full queue.
    pub evicted: AtomicU64,
    /// Records refused by a full queue.
    pub rejected: AtomicU64,
}

impl PoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self, pending: usize) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending,
        }
    }
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub produced: u64,
    pub encode_failures: u64,
    pub attempted: u64,
    pub sent: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub pending: usize,
}

/// Destination queues, popped round-robin.
///
/// Only destinations with pending records are kept; a queue is removed as
/// soon as it empties, so per-message destinations do not accumulate.
struct QueueSet {
    queues: HashMap<Destination, OutboundQueue>,
    order: VecDeque<Destination>,
    total: usize,
    capacity: Option<usize>,
    policy: OverflowPolicy,
}

impl QueueSet {
    fn new(capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            queues: HashMap::new(),
            order: VecDeque::new(),
            total: 0,
            capacity,
            policy,
        }
    }

    fn queue_for(&mut self, dest: &Destination) -> &mut OutboundQueue {
        if !self.queues.contains_key(dest) {
            self.order.push_back(dest.clone());
        }
        let (capacity, policy) = (self.capacity, self.policy);
        self.queues
            .entry(dest.clone())
            .or_insert_with(|| OutboundQueue::bounded(capacity, policy))
    }

    fn remove(&mut self, dest: &Destination) {
        self.queues.remove(dest);
        self.order.retain(|d| d != dest);
    }

    fn push(&mut self, record: OutboundRecord) -> PushOutcome {
        let dest = record.destination.clone();
        let queue = self.queue_for(&dest);
        let outcome = queue.push_back(record);
        let empty = queue.is_empty();

        match outcome {
            PushOutcome::Queued => self.total += 1,
            // Zero capacity leaves nothing behind
            PushOutcome::Rejected(_) if empty => self.remove(&dest),
            _ => {}
        }
        outcome
    }

    fn pop_next(&mut self) -> Option<OutboundRecord> {
        let dest = self.order.pop_front()?;
        let Some(queue) = self.queues.get_mut(&dest) else {
            return self.pop_next();
        };
        let record = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&dest);
        } else {
            self.order.push_back(dest);
        }
        if record.is_some() {
            self.total -= 1;
        }
        record
    }

    fn requeue(&mut self, record: OutboundRecord) {
        let dest = record.destination.clone();
        self.queue_for(&dest).push_front(record);
        self.total += 1;
    }

    fn len_of(&self, dest: &str) -> usize {
        self.queues.get(dest).map_or(0, OutboundQueue::len)
    }
}

struct PoolInner<B: BrokerClient> {
    supervisor: ConnectionSupervisor<B>,
    default_encoder: MessageEncoder,
    encoders: HashMap<Destination, MessageEncoder>,
    queues: Mutex<QueueSet>,
    options: PoolOptions,
    draining: AtomicBool,
    in_flight: AtomicUsize,
    stats: PoolStats,
}

impl<B: BrokerClient> PoolInner<B> {
    fn lock_queues(&self) -> MutexGuard<'_, QueueSet> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pending(&self) -> usize {
        self.lock_queues().total
    }

    /// Start a drain task unless one is already running.
    fn schedule_drain(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.drain().await;
        });
    }

    async fn drain(&self) {
        let mut attempted = 0u64;
        let mut sent = 0u64;

        loop {
            let interrupted = self.drain_cycle(&mut attempted, &mut sent).await;
            self.draining.store(false, Ordering::Release);

            // A produce() racing with the end of the cycle saw `draining`
            // still set and left its record to us.
            if interrupted || !self.supervisor.is_connected() || self.pending() == 0 {
                break;
            }
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                break;
            }
        }

        if attempted > 0 {
            tracing::info!(
                "Drain cycle finished: {}/{} messages sent",
                sent,
                attempted
            );
        }
    }

    /// Send until the queues are empty or the connection is lost.
    ///
    /// Returns true if the cycle stopped on a transport outage.
    async fn drain_cycle(&self, attempted: &mut u64, sent: &mut u64) -> bool {
        loop {
            let Some(handle) = self.supervisor.handle() else {
                return false;
            };
            let next = {
                let mut queues = self.lock_queues();
                let next = queues.pop_next();
                if next.is_some() {
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                }
                next
            };
            let Some(mut record) = next else {
                return false;
            };

            *attempted += 1;
            PoolStats::bump(&self.stats.attempted);

            let timeout = self.options.send_timeout;
            let result = match tokio::time::timeout(
                timeout,
                self.supervisor.client().publish(
                    &handle,
                    record.destination.as_str(),
                    &record.payload,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };

            match result {
                Ok(()) => {
                    *sent += 1;
                    PoolStats::bump(&self.stats.sent);
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                Err(err) if err.is_unavailable() => {
                    record.attempts += 1;
                    tracing::warn!(
                        "Send to '{}' failed ({}), requeueing (attempt {})",
                        record.destination,
                        err,
                        record.attempts
                    );
                    self.supervisor.reset();
                    self.lock_queues().requeue(record);
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    PoolStats::bump(&self.stats.requeued);
                    return true;
                }
                Err(err) => {
                    tracing::warn!(
                        "Dropping message for '{}' ({} bytes): {}",
                        record.destination,
                        record.payload.len(),
                        err
                    );
                    PoolStats::bump(&self.stats.dropped);
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
}

impl<B: BrokerClient> Drop for PoolInner<B> {
    fn drop(&mut self) {
        let pending = self.lock_queues().total;
        if pending > 0 {
            tracing::warn!("Producer pool dropped with {} unsent messages", pending);
        }
    }
}

/// Builder for [`ProducerPool`].
pub struct ProducerPoolBuilder<B: BrokerClient> {
    client: Arc<B>,
    endpoints: Vec<String>,
    options: PoolOptions,
    default_encoder: MessageEncoder,
    encoders: HashMap<Destination, MessageEncoder>,
}

impl<B: BrokerClient> ProducerPoolBuilder<B> {
    /// Broker endpoints to connect to.
    pub fn endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Tuning options.
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Encode records for `destination` with `schema`.
    pub fn schema(mut self, destination: impl Into<Destination>, schema: Schema) -> Self {
        self.encoders
            .insert(destination.into(), MessageEncoder::with_schema(schema));
        self
    }

    /// Schema for destinations without their own.
    pub fn default_schema(mut self, schema: Schema) -> Self {
        self.default_encoder = MessageEncoder::with_schema(schema);
        self
    }

    /// Build the pool and start its connection watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> ProducerPool<B> {
        let supervisor = ConnectionSupervisor::new(
            "sink",
            self.client,
            self.endpoints,
            self.options.connect_timeout,
        );

        let inner = Arc::new(PoolInner {
            supervisor,
            default_encoder: self.default_encoder,
            encoders: self.encoders,
            queues: Mutex::new(QueueSet::new(
                self.options.max_pending,
                self.options.overflow,
            )),
            options: self.options,
            draining: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            stats: PoolStats::default(),
        });

        spawn_watcher(&inner);
        ProducerPool { inner }
    }
}

enum WatchAction {
    Wait,
    Backoff,
}

fn spawn_watcher<B: BrokerClient>(inner: &Arc<PoolInner<B>>) {
    let weak: Weak<PoolInner<B>> = Arc::downgrade(inner);
    let mut rx = inner.supervisor.watch_state();
    let initial = inner.options.reconnect_initial;
    let max = inner.options.reconnect_max;

    tokio::spawn(async move {
        let mut backoff = initial;

        loop {
            let state = *rx.borrow_and_update();
            let action = {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match state {
                    ConnectionState::Connected => {
                        backoff = initial;
                        inner.schedule_drain();
                        WatchAction::Wait
                    }
                    ConnectionState::Disconnected
                        if !initial.is_zero() && inner.pending() > 0 =>
                    {
                        WatchAction::Backoff
                    }
                    _ => WatchAction::Wait,
                }
            };

            match action {
                WatchAction::Wait => {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                WatchAction::Backoff => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {
                            let Some(inner) = weak.upgrade() else {
                                break;
                            };
                            if inner.supervisor.state() == ConnectionState::Disconnected
                                && inner.pending() > 0
                            {
                                tracing::debug!("Reconnecting after {:?}", backoff);
                                inner.supervisor.connect();
                            }
                            backoff = (backoff * 2).min(max);
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });
}

/// Reliable producer façade.
///
/// Cloning is cheap; clones share queues and connection.
pub struct ProducerPool<B: BrokerClient> {
    inner: Arc<PoolInner<B>>,
}

impl<B: BrokerClient> Clone for ProducerPool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: BrokerClient> ProducerPool<B> {
    /// Start building a pool on top of `client`.
    pub fn builder(client: Arc<B>) -> ProducerPoolBuilder<B> {
        ProducerPoolBuilder {
            client,
            endpoints: Vec::new(),
            options: PoolOptions::default(),
            default_encoder: MessageEncoder::plain(),
            encoders: HashMap::new(),
        }
    }

    /// Create a pool with default options and no schemas.
    pub fn new(client: Arc<B>, endpoints: Vec<String>) -> Self {
        Self::builder(client).endpoints(endpoints).build()
    }

    /// Queue a value for `destination`.
    ///
    /// Never blocks and never fails: a value that cannot be encoded is
    /// logged and skipped, connection problems are handled in the
    /// background.
    pub fn produce(&self, destination: impl Into<Destination>, value: impl Into<OutboundValue>) {
        let destination = destination.into();
        let value = value.into();
        let inner = &self.inner;
        PoolStats::bump(&inner.stats.produced);

        let encoder = inner
            .encoders
            .get(&destination)
            .unwrap_or(&inner.default_encoder);
        let payload = match encoder.encode(&value) {
            Ok(payload) => payload,
            Err(err) => {
                PoolStats::bump(&inner.stats.encode_failures);
                tracing::warn!("Skipping message for '{}': {}", destination, err);
                return;
            }
        };

        let outcome = inner
            .lock_queues()
            .push(OutboundRecord::new(destination, payload));

        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::Evicted(evicted) => {
                PoolStats::bump(&inner.stats.evicted);
                tracing::warn!(
                    "Queue for '{}' full, evicted oldest message (queued {:?} ago)",
                    evicted.destination,
                    evicted.enqueued_at.elapsed()
                );
            }
            PushOutcome::Rejected(rejected) => {
                PoolStats::bump(&inner.stats.rejected);
                tracing::warn!(
                    "Queue for '{}' full, rejected new message",
                    rejected.destination
                );
                return;
            }
        }

        if !inner.supervisor.is_connected() {
            inner.supervisor.connect();
            return;
        }

        inner.schedule_drain();
    }

    /// Wait until every queued record has been handed to the broker.
    ///
    /// Returns false if records are still pending after `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending() == 0 && self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            if self.inner.supervisor.is_connected() {
                self.inner.schedule_drain();
            } else {
                self.inner.supervisor.connect();
            }

            tokio::time::sleep(FLUSH_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Total records waiting to be sent.
    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    /// Records waiting for one destination.
    pub fn pending_for(&self, destination: &str) -> usize {
        self.inner.lock_queues().len_of(destination)
    }

    /// Queued payloads for one destination, in send order.
    pub fn queued_payloads(&self, destination: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock_queues()
            .queues
            .get(destination)
            .map(|q| q.iter().map(|r| r.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Destinations with records waiting, in drain order.
    pub fn destinations(&self) -> Vec<Destination> {
        self.inner.lock_queues().order.iter().cloned().collect()
    }

    /// The connection supervisor.
    pub fn supervisor(&self) -> &ConnectionSupervisor<B> {
        &self.inner.supervisor
    }

    /// Whether a drain task is running.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Get snapshot of pool statistics.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot(self.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBroker;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(2);

    fn no_backoff() -> PoolOptions {
        PoolOptions {
            reconnect_initial: Duration::ZERO,
            ..Default::default()
        }
    }

    fn pool(broker: &Arc<MockBroker>, options: PoolOptions) -> ProducerPool<MockBroker> {
        ProducerPool::builder(Arc::clone(broker))
            .endpoints(vec!["mock://broker".into()])
            .options(options)
            .build()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    fn json_payloads(payloads: Vec<Vec<u8>>) -> Vec<serde_json::Value> {
        payloads
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_produce_when_connected_sends() {
        let broker = Arc::new(MockBroker::new());
        let pool = pool(&broker, no_backoff());

        pool.produce("t1", json!({"a": 1}));
        assert!(pool.flush(WAIT).await);

        assert_eq!(json_payloads(broker.published_to("t1")), vec![json!({"a": 1})]);
        let stats = pool.stats();
        assert_eq!(stats.produced, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_disconnected_produce_queues_in_order() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(&broker, no_backoff());

        pool.produce("t1", json!({"a": 1}));
        pool.produce("t1", json!({"a": 2}));

        assert_eq!(pool.pending_for("t1"), 2);
        assert_eq!(
            json_payloads(pool.queued_payloads("t1")),
            vec![json!({"a": 1}), json!({"a": 2})]
        );

        // Connection attempt fails in the background; nothing is lost
        assert!(wait_until(|| pool.supervisor().state() == ConnectionState::Disconnected).await);
        assert_eq!(pool.pending_for("t1"), 2);

        broker.set_available(true);
        pool.supervisor().connect();

        assert!(wait_until(|| pool.pending() == 0).await);
        assert!(pool.flush(WAIT).await);
        assert_eq!(
            json_payloads(broker.published_to("t1")),
            vec![json!({"a": 1}), json!({"a": 2})]
        );
    }

    #[tokio::test]
    async fn test_encoding_failure_queues_nothing() {
        let broker = Arc::new(MockBroker::unavailable());
        let schema = Schema::parse(&json!({
            "type": "record",
            "name": "A",
            "fields": [{"name": "a", "type": "long"}]
        }))
        .unwrap();
        let pool = ProducerPool::builder(Arc::clone(&broker))
            .options(no_backoff())
            .schema("t1", schema)
            .build();

        pool.produce("t1", json!({"b": 1}));
        assert_eq!(pool.pending_for("t1"), 0);
        assert_eq!(pool.stats().encode_failures, 1);

        // Other destinations are unaffected by the schema
        pool.produce("t2", json!({"b": 1}));
        assert_eq!(pool.pending_for("t2"), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_requeues_at_front() {
        let broker = Arc::new(MockBroker::new());
        let pool = pool(&broker, no_backoff());

        pool.supervisor().connect();
        assert!(pool.supervisor().wait_connected(WAIT).await);

        broker.set_available(false);
        pool.produce("t1", "r1");
        pool.produce("t1", "r2");

        assert!(wait_until(|| !pool.supervisor().is_connected() && !pool.is_draining()).await);
        assert_eq!(pool.queued_payloads("t1"), vec![b"r1".to_vec(), b"r2".to_vec()]);
        assert!(pool.stats().requeued >= 1);

        broker.set_available(true);
        pool.produce("t1", "r3");
        assert!(pool.flush(WAIT).await);

        assert_eq!(
            broker.published_to("t1"),
            vec![b"r1".to_vec(), b"r2".to_vec(), b"r3".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_permanent_error_drops_only_that_record() {
        let broker = Arc::new(MockBroker::new());
        let pool = pool(&broker, no_backoff());
        pool.supervisor().connect();
        assert!(pool.supervisor().wait_connected(WAIT).await);

        broker.fail_next_publish(TransportError::Rejected("message too large".into()));
        pool.produce("t1", "bad");
        pool.produce("t1", "good");
        assert!(pool.flush(WAIT).await);

        assert_eq!(broker.published_to("t1"), vec![b"good".to_vec()]);
        assert_eq!(pool.stats().dropped, 1);
        assert!(pool.supervisor().is_connected());
    }

    #[tokio::test]
    async fn test_send_timeout_treated_as_outage() {
        let broker = Arc::new(MockBroker::new());
        let pool = pool(
            &broker,
            PoolOptions {
                send_timeout: Duration::from_millis(20),
                ..no_backoff()
            },
        );
        pool.supervisor().connect();
        assert!(pool.supervisor().wait_connected(WAIT).await);

        broker.set_publish_delay(Duration::from_millis(200));
        pool.produce("t1", "slow");

        assert!(wait_until(|| pool.stats().requeued == 1).await);
        assert!(wait_until(|| !pool.is_draining()).await);
        assert_eq!(pool.pending_for("t1"), 1);
        assert_eq!(pool.supervisor().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_automatic_reconnect_with_backoff() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(
            &broker,
            PoolOptions {
                reconnect_initial: Duration::from_millis(10),
                reconnect_max: Duration::from_millis(40),
                ..Default::default()
            },
        );

        pool.produce("t1", "queued");
        assert!(wait_until(|| broker.connect_attempts() >= 2).await);

        broker.set_available(true);
        assert!(wait_until(|| pool.pending() == 0).await);
        assert!(pool.flush(WAIT).await);
        assert_eq!(broker.published_to("t1"), vec![b"queued".to_vec()]);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(
            &broker,
            PoolOptions {
                max_pending: Some(2),
                ..no_backoff()
            },
        );

        pool.produce("t1", "a");
        pool.produce("t1", "b");
        pool.produce("t1", "c");

        assert_eq!(pool.queued_payloads("t1"), vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(pool.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_overflow_rejects_new() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(
            &broker,
            PoolOptions {
                max_pending: Some(1),
                overflow: OverflowPolicy::RejectNew,
                ..no_backoff()
            },
        );

        pool.produce("t1", "a");
        pool.produce("t1", "b");

        assert_eq!(pool.queued_payloads("t1"), vec![b"a".to_vec()]);
        assert_eq!(pool.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_per_destination_order_with_many_destinations() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(&broker, no_backoff());

        for i in 0..20 {
            pool.produce(format!("t{}", i % 3), json!(i));
        }
        assert_eq!(pool.destinations().len(), 3);

        broker.set_available(true);
        pool.supervisor().connect();
        assert!(pool.flush(WAIT).await);

        for d in 0..3 {
            let expected: Vec<_> = (0..20).filter(|i| i % 3 == d).map(|i| json!(i)).collect();
            assert_eq!(
                json_payloads(broker.published_to(&format!("t{}", d))),
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_drained_destinations_are_released() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(&broker, no_backoff());

        for i in 0..500 {
            pool.produce(format!("out/device-{}", i), json!(i));
        }
        pool.produce("hot", "a");
        pool.produce("hot", "b");
        assert_eq!(pool.destinations().len(), 501);

        broker.set_available(true);
        pool.supervisor().connect();
        assert!(pool.flush(WAIT).await);

        assert!(pool.destinations().is_empty());
        assert!(pool.inner.lock_queues().queues.is_empty());
        assert_eq!(broker.published_to("hot"), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_queue_set_requeue_keeps_bound() {
        let mut set = QueueSet::new(Some(1), OverflowPolicy::RejectNew);
        let dest = Destination::from("t1");

        assert!(matches!(
            set.push(OutboundRecord::new(dest.clone(), b"r1".to_vec())),
            PushOutcome::Queued
        ));
        let r1 = set.pop_next().unwrap();
        assert!(set.queues.is_empty());
        assert!(set.order.is_empty());

        // Retried record recreates the queue with the configured bound
        set.requeue(r1);
        assert_eq!(set.len_of("t1"), 1);
        assert!(matches!(
            set.push(OutboundRecord::new(dest, b"r2".to_vec())),
            PushOutcome::Rejected(_)
        ));
        assert_eq!(set.total, 1);
    }

    #[test]
    fn test_queue_set_zero_capacity_leaves_no_queue() {
        let mut set = QueueSet::new(Some(0), OverflowPolicy::DropOldest);
        let outcome = set.push(OutboundRecord::new("t1".into(), b"x".to_vec()));
        assert!(matches!(outcome, PushOutcome::Rejected(_)));
        assert!(set.queues.is_empty());
        assert!(set.order.is_empty());
    }

    #[tokio::test]
    async fn test_flush_times_out_while_unavailable() {
        let broker = Arc::new(MockBroker::unavailable());
        let pool = pool(&broker, no_backoff());

        pool.produce("t1", "stuck");
        assert!(!pool.flush(Duration::from_millis(50)).await);
        assert_eq!(pool.pending(), 1);
    }
}
