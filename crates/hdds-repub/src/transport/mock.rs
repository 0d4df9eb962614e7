// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory broker for tests and dry runs.
//!
//! Published messages are recorded in order and looped back to matching
//! subscriptions. Availability, connect latency and per-publish failures can
//! be scripted to exercise the reconnect and requeue paths.

use super::{topic_matches, BrokerClient, DeliveryCallback, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A message accepted by the mock broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub destination: String,
    pub payload: Vec<u8>,
}

/// Handle returned by [`MockBroker::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockHandle {
    /// Connection number (1 for the first successful connect).
    pub session: u64,
}

struct MockState {
    available: bool,
    connect_delay: Duration,
    publish_delay: Duration,
    connect_attempts: u64,
    sessions: u64,
    publish_failures: VecDeque<TransportError>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(String, Arc<dyn DeliveryCallback>)>,
}

/// Mock broker client.
pub struct MockBroker {
    state: Mutex<MockState>,
}

impl MockBroker {
    /// Create an available broker with no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                available: true,
                connect_delay: Duration::ZERO,
                publish_delay: Duration::ZERO,
                connect_attempts: 0,
                sessions: 0,
                publish_failures: VecDeque::new(),
                published: Vec::new(),
                subscriptions: Vec::new(),
            }),
        }
    }

    /// Create a broker that refuses connections until made available.
    pub fn unavailable() -> Self {
        let broker = Self::new();
        broker.set_available(false);
        broker
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the broker reachable or unreachable.
    ///
    /// While unavailable, connects fail and publishes return
    /// [`TransportError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Delay applied to every connect attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Delay applied to every publish.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.lock().publish_delay = delay;
    }

    /// Fail the next publish with `error` (queued, one per call).
    pub fn fail_next_publish(&self, error: TransportError) {
        self.lock().publish_failures.push_back(error);
    }

    /// Number of connect attempts seen so far.
    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Number of successful connects.
    pub fn sessions(&self) -> u64 {
        self.lock().sessions
    }

    /// Number of active subscription filters.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// All messages accepted so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Payloads accepted for one destination, in order.
    pub fn published_to(&self, destination: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.destination == destination)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Deliver a message to subscribers as if another client published it.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let callbacks: Vec<_> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback.on_message(topic, payload);
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for MockBroker {
    type Handle = MockHandle;

    async fn connect(&self, _endpoints: &[String]) -> Result<MockHandle, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            state.connect_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if !state.available {
            return Err(TransportError::Connect("no brokers available".into()));
        }
        state.sessions += 1;
        Ok(MockHandle {
            session: state.sessions,
        })
    }

    async fn publish(
        &self,
        _handle: &MockHandle,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let delay = self.lock().publish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.lock();
            if !state.available {
                return Err(TransportError::Unavailable("no brokers available".into()));
            }
            if let Some(err) = state.publish_failures.pop_front() {
                return Err(err);
            }
            state.published.push(PublishedMessage {
                destination: destination.to_string(),
                payload: payload.to_vec(),
            });
        }

        self.inject(destination, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        _handle: &MockHandle,
        topics: &[String],
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.available {
            return Err(TransportError::Unavailable("no brokers available".into()));
        }
        // Resubscribing the same callback to the same filter is a no-op
        for topic in topics {
            let known = state
                .subscriptions
                .iter()
                .any(|(filter, cb)| filter == topic && Arc::ptr_eq(cb, &callback));
            if !known {
                state
                    .subscriptions
                    .push((topic.clone(), Arc::clone(&callback)));
            }
        }
        Ok(())
    }
}
