// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction.
//!
//! The republisher never talks to an MQTT or Kafka library directly. It goes
//! through [`BrokerClient`], which exposes the three operations it needs:
//! connect, publish and subscribe.
//!
//! # Integration
//!
//! ```ignore
//! impl BrokerClient for KafkaClient {
//!     type Handle = FutureProducer;
//!
//!     async fn connect(&self, endpoints: &[String]) -> Result<Self::Handle, TransportError> {
//!         // Build a producer for `endpoints`...
//!     }
//!     // ...
//! }
//! ```
//!
//! Implementations should map "no brokers available" style failures to
//! [`TransportError::Unavailable`] so the pool requeues instead of dropping.

pub mod mock;
pub mod stdio;

pub use crate::error::TransportError;
pub use mock::{MockBroker, PublishedMessage};
pub use stdio::StdioBroker;

use std::future::Future;
use std::sync::Arc;

/// Receives messages delivered by a subscription.
///
/// Called on the transport's own thread or task; implementations must hand
/// the message off quickly and never block.
pub trait DeliveryCallback: Send + Sync {
    /// Called for every message received on a subscribed topic.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Abstract broker client.
pub trait BrokerClient: Send + Sync + 'static {
    /// Connection handle returned by [`connect`](Self::connect).
    type Handle: Send + Sync + 'static;

    /// Establish a connection to one of `endpoints`.
    fn connect(
        &self,
        endpoints: &[String],
    ) -> impl Future<Output = Result<Self::Handle, TransportError>> + Send;

    /// Publish one payload to `destination`.
    ///
    /// Returns once the broker acknowledged the message.
    fn publish(
        &self,
        handle: &Self::Handle,
        destination: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to `topics`, delivering every message to `callback`.
    fn subscribe(
        &self,
        handle: &Self::Handle,
        topics: &[String],
        callback: Arc<dyn DeliveryCallback>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Check if a topic matches a subscription filter.
///
/// Filters use MQTT wildcards: `+` matches exactly one level and a trailing
/// `#` matches any number of remaining levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == "#" {
        return true;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check if a filter contains MQTT wildcards.
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}
