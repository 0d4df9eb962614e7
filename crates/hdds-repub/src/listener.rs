// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound listener.
//!
//! Bridges the broker's subscribe callbacks into the rule engine. The
//! callback only copies the delivery into a bounded channel; parsing, rule
//! evaluation and `produce()` run on the listener task.

use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::error::RepubError;
use crate::pool::ProducerPool;
use crate::rules::{Record, RuleEngine};
use crate::transport::{BrokerClient, DeliveryCallback};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Field holding the source topic.
pub const TOPIC_FIELD: &str = "topic";
/// Field holding a payload that was not a JSON object.
pub const PAYLOAD_FIELD: &str = "payload";

/// A received message, parsed into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub record: Record,
    /// True when the payload was not a JSON object.
    pub raw: bool,
}

impl InboundMessage {
    /// Parse a delivery.
    ///
    /// A JSON object payload becomes the record; anything else is wrapped as
    /// `{"payload": "<text>"}`. The topic is always stored under `topic`.
    pub fn parse(topic: &str, payload: &[u8]) -> Self {
        let (mut record, raw) = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => (map, false),
            _ => {
                let mut map = Record::new();
                map.insert(
                    PAYLOAD_FIELD.to_string(),
                    Value::String(String::from_utf8_lossy(payload).into_owned()),
                );
                (map, true)
            }
        };
        record.insert(TOPIC_FIELD.to_string(), Value::String(topic.to_string()));

        Self {
            topic: topic.to_string(),
            record,
            raw,
        }
    }
}

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Deliveries buffered between the broker callback and the listener.
    pub channel_capacity: usize,
    /// First source reconnect delay.
    pub reconnect_initial: Duration,
    /// Source reconnect delay cap.
    pub reconnect_max: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Listener counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub received: AtomicU64,
    pub parse_fallbacks: AtomicU64,
    pub instructions: AtomicU64,
    /// Deliveries lost because the channel was full.
    pub overflowed: AtomicU64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            parse_fallbacks: self.parse_fallbacks.load(Ordering::Relaxed),
            instructions: self.instructions.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub received: u64,
    pub parse_fallbacks: u64,
    pub instructions: u64,
    pub overflowed: u64,
}

struct Delivery {
    topic: String,
    payload: Vec<u8>,
}

struct ChannelBridge {
    tx: mpsc::Sender<Delivery>,
    stats: Arc<ListenerStats>,
}

impl DeliveryCallback for ChannelBridge {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        let delivery = Delivery {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        match self.tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(d)) => {
                self.stats.overflowed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping inbound message on '{}' (channel full)", d.topic);
            }
            Err(mpsc::error::TrySendError::Closed(d)) => {
                tracing::debug!("Dropping inbound message on '{}' (listener stopped)", d.topic);
            }
        }
    }
}

/// Feeds source messages through the rules into a producer pool.
pub struct InboundListener<S: BrokerClient, P: BrokerClient> {
    source: ConnectionSupervisor<S>,
    topics: Vec<String>,
    engine: Arc<RuleEngine>,
    pool: ProducerPool<P>,
    options: ListenerOptions,
    stats: Arc<ListenerStats>,
    running: Arc<AtomicBool>,
}

impl<S: BrokerClient, P: BrokerClient> InboundListener<S, P> {
    pub fn new(
        source: ConnectionSupervisor<S>,
        topics: Vec<String>,
        engine: Arc<RuleEngine>,
        pool: ProducerPool<P>,
    ) -> Self {
        Self {
            source,
            topics,
            engine,
            pool,
            options: ListenerOptions::default(),
            stats: Arc::new(ListenerStats::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Supervisor of the source connection.
    pub fn source(&self) -> &ConnectionSupervisor<S> {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Process one delivery synchronously.
    ///
    /// Returns the number of publish instructions handed to the pool.
    pub fn handle_delivery(&self, topic: &str, payload: &[u8]) -> usize {
        process(&self.engine, &self.pool, &self.stats, topic, payload)
    }

    /// Connect the source, subscribe and start processing deliveries.
    pub fn run(&self) -> Result<ListenerHandle, RepubError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RepubError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let bridge: Arc<dyn DeliveryCallback> = Arc::new(ChannelBridge {
            tx,
            stats: Arc::clone(&self.stats),
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = ListenerTask {
            source: self.source.clone(),
            topics: self.topics.clone(),
            engine: Arc::clone(&self.engine),
            pool: self.pool.clone(),
            options: self.options.clone(),
            stats: Arc::clone(&self.stats),
            bridge,
        };

        tracing::info!(
            "Listener started on {} topic(s): {}",
            self.topics.len(),
            self.topics.join(", ")
        );

        let running = Arc::clone(&self.running);
        let join = tokio::spawn(async move {
            task.run(rx, stop_rx).await;
            running.store(false, Ordering::Release);
        });

        Ok(ListenerHandle {
            stop_tx,
            join,
            stats: Arc::clone(&self.stats),
        })
    }
}

fn process<P: BrokerClient>(
    engine: &RuleEngine,
    pool: &ProducerPool<P>,
    stats: &ListenerStats,
    topic: &str,
    payload: &[u8],
) -> usize {
    stats.received.fetch_add(1, Ordering::Relaxed);

    let message = InboundMessage::parse(topic, payload);
    if message.raw {
        stats.parse_fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Payload on '{}' is not a JSON object, using raw text", topic);
    }

    let instructions = engine.evaluate(&message);
    let count = instructions.len();
    for (destination, value) in instructions {
        pool.produce(destination, value);
    }
    stats.instructions.fetch_add(count as u64, Ordering::Relaxed);
    count
}

struct ListenerTask<S: BrokerClient, P: BrokerClient> {
    source: ConnectionSupervisor<S>,
    topics: Vec<String>,
    engine: Arc<RuleEngine>,
    pool: ProducerPool<P>,
    options: ListenerOptions,
    stats: Arc<ListenerStats>,
    bridge: Arc<dyn DeliveryCallback>,
}

impl<S: BrokerClient, P: BrokerClient> ListenerTask<S, P> {
    async fn run(self, mut rx: mpsc::Receiver<Delivery>, mut stop_rx: watch::Receiver<bool>) {
        let mut state_rx = self.source.watch_state();
        let mut backoff = self.options.reconnect_initial;
        let mut reconnect_at: Option<Instant> = None;

        self.source.connect();
        let mut state = *state_rx.borrow_and_update();
        if state == ConnectionState::Connected {
            self.subscribe().await;
        }

        loop {
            if state == ConnectionState::Connected {
                backoff = self.options.reconnect_initial;
                reconnect_at = None;
            } else if state == ConnectionState::Disconnected
                && reconnect_at.is_none()
                && !backoff.is_zero()
            {
                reconnect_at = Some(Instant::now() + backoff);
            }

            tokio::select! {
                biased;

                stopped = stop_rx.changed() => {
                    // Finish what the broker already handed over, unless the
                    // handle was dropped
                    rx.close();
                    if stopped.is_ok() {
                        while let Ok(delivery) = rx.try_recv() {
                            process(&self.engine, &self.pool, &self.stats, &delivery.topic, &delivery.payload);
                        }
                    }
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    state = *state_rx.borrow_and_update();
                    if state == ConnectionState::Connected {
                        self.subscribe().await;
                    }
                }
                _ = sleep_until_opt(reconnect_at) => {
                    reconnect_at = None;
                    tracing::debug!("Reconnecting source after {:?}", backoff);
                    backoff = (backoff * 2).min(self.options.reconnect_max);
                    self.source.connect();
                    state = self.source.state();
                }
                Some(delivery) = rx.recv() => {
                    process(&self.engine, &self.pool, &self.stats, &delivery.topic, &delivery.payload);
                }
            }
        }

        tracing::info!("Listener stopped");
    }

    async fn subscribe(&self) {
        let Some(handle) = self.source.handle() else {
            return;
        };
        match self
            .source
            .client()
            .subscribe(&handle, &self.topics, Arc::clone(&self.bridge))
            .await
        {
            Ok(()) => tracing::info!("Subscribed to {} topic(s)", self.topics.len()),
            Err(err) if err.is_unavailable() => {
                tracing::warn!("Subscribe failed ({}), resetting source connection", err);
                self.source.reset();
            }
            Err(err) => tracing::error!("Subscribe failed: {}", err),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running listener.
///
/// Dropping the handle also stops the listener; deliveries still buffered
/// are discarded.
pub struct ListenerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<ListenerStats>,
}

impl ListenerHandle {
    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the listener and wait for its task to end.
    ///
    /// Deliveries already buffered are processed first.
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.join.await {
            tracing::error!("Listener task failed: {}", e);
        }
    }
}
