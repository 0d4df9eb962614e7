// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Republisher
//!
//! Rule-based message republishing with reliable, non-blocking delivery.
//!
//! # Features
//!
//! - **Producer Pool**: `produce()` never blocks; records are queued per
//!   destination and drained in order while the broker is reachable
//! - **Connection Supervision**: single in-flight connect attempt, reset on
//!   outage, automatic reconnect with backoff
//! - **Schema Encoding**: Avro binary encoding per destination
//! - **Rules**: match on topic and payload fields, template the output value
//!   and the destination
//!
//! # Data Flow
//!
//! ```text
//! broker callback -> InboundListener -> RuleEngine -> ProducerPool
//!                                                        |
//!                                   MessageEncoder -> OutboundQueue -> drain -> broker
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! # Write an example configuration
//! hdds-repub gen-config -o repub.toml
//!
//! # Try the rules on one message
//! hdds-repub eval -c repub.toml -t sensors/temp -p '{"value": 42}'
//!
//! # Republish stdin lines ("topic<TAB>payload") to stdout
//! hdds-repub --config repub.toml < input.tsv
//! ```
//!
//! # Library Use
//!
//! ```no_run
//! use hdds_repub::transport::MockBroker;
//! use hdds_repub::ProducerPool;
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let broker = Arc::new(MockBroker::new());
//! let pool = ProducerPool::new(broker, vec!["mock://local".into()]);
//! pool.produce("out/temp", serde_json::json!({"v": 42}));
//! pool.flush(std::time::Duration::from_secs(1)).await;
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod encoder;
pub mod error;
pub mod listener;
pub mod pool;
pub mod queue;
pub mod rules;
pub mod schema;
pub mod transport;

pub use config::{RepubConfig, RuleConfig, SinkConfig, SourceConfig};
pub use connection::{ConnectionState, ConnectionSupervisor};
pub use encoder::{MessageEncoder, OutboundValue};
pub use error::{ConfigError, EncodingError, RepubError, RuleError, SchemaError, TransportError};
pub use listener::{
    InboundListener, InboundMessage, ListenerHandle, ListenerOptions, ListenerStats,
    ListenerStatsSnapshot,
};
pub use pool::{PoolOptions, PoolStats, PoolStatsSnapshot, ProducerPool, ProducerPoolBuilder};
pub use queue::{Destination, OutboundQueue, OutboundRecord, OverflowPolicy};
pub use rules::{FieldMatcher, Record, Rule, RuleEngine, Template, Transform};
pub use schema::Schema;
pub use transport::{BrokerClient, DeliveryCallback};
