// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end republishing tests
//!
//! Drives listener, rules and producer pool against the in-memory broker,
//! including broker outages and reconnects.

use hdds_repub::transport::MockBroker;
use hdds_repub::{
    ConnectionState, ConnectionSupervisor, InboundListener, ListenerOptions, PoolOptions,
    ProducerPool, RuleConfig, RuleEngine, Schema, TransportError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

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

fn manual_reconnect() -> PoolOptions {
    PoolOptions {
        reconnect_initial: Duration::ZERO,
        ..Default::default()
    }
}

fn as_json(payloads: Vec<Vec<u8>>) -> Vec<Value> {
    payloads
        .iter()
        .map(|p| serde_json::from_slice(p).unwrap())
        .collect()
}

#[tokio::test]
async fn test_queue_while_unavailable_then_drain_in_order() {
    let broker = Arc::new(MockBroker::unavailable());
    let pool = ProducerPool::builder(Arc::clone(&broker))
        .endpoints(vec!["mock://sink".into()])
        .options(manual_reconnect())
        .build();

    pool.produce("t1", json!({"a": 1}));
    pool.produce("t1", json!({"a": 2}));

    assert_eq!(pool.pending_for("t1"), 2);
    assert!(broker.published().is_empty());

    assert!(wait_until(|| pool.supervisor().state() == ConnectionState::Disconnected).await);
    broker.set_available(true);
    pool.supervisor().connect();

    assert!(pool.flush(WAIT).await);
    assert_eq!(
        as_json(broker.published_to("t1")),
        vec![json!({"a": 1}), json!({"a": 2})]
    );
    assert_eq!(pool.pending_for("t1"), 0);
}

#[tokio::test]
async fn test_outage_mid_drain_keeps_record_first() {
    let broker = Arc::new(MockBroker::new());
    let pool = ProducerPool::builder(Arc::clone(&broker))
        .options(manual_reconnect())
        .build();

    pool.supervisor().connect();
    assert!(pool.supervisor().wait_connected(WAIT).await);

    broker.fail_next_publish(TransportError::Unavailable("no brokers available".into()));
    pool.produce("t1", "r1");
    pool.produce("t1", "r2");

    assert!(wait_until(|| pool.stats().requeued == 1 && !pool.is_draining()).await);
    assert!(!pool.supervisor().is_connected());
    assert_eq!(
        pool.queued_payloads("t1"),
        vec![b"r1".to_vec(), b"r2".to_vec()]
    );

    // Next produce reconnects and restarts the drain
    pool.produce("t1", "r3");
    assert!(pool.flush(WAIT).await);
    assert_eq!(
        broker.published_to("t1"),
        vec![b"r1".to_vec(), b"r2".to_vec(), b"r3".to_vec()]
    );
}

#[tokio::test]
async fn test_concurrent_connect_calls_start_one_attempt() {
    let broker = Arc::new(MockBroker::new());
    broker.set_connect_delay(Duration::from_millis(50));
    let supervisor = ConnectionSupervisor::new(
        "sink",
        Arc::clone(&broker),
        vec!["mock://sink".into()],
        Duration::from_secs(1),
    );

    let started: Vec<bool> = (0..10).map(|_| supervisor.connect()).collect();
    assert_eq!(started.iter().filter(|s| **s).count(), 1);

    assert!(supervisor.wait_connected(WAIT).await);
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(supervisor.connect_attempts(), 1);
}

#[tokio::test]
async fn test_produce_storm_while_connecting() {
    let broker = Arc::new(MockBroker::new());
    broker.set_connect_delay(Duration::from_millis(30));
    let pool = ProducerPool::builder(Arc::clone(&broker))
        .options(manual_reconnect())
        .build();

    for i in 0..100 {
        pool.produce("t1", json!(i));
    }
    assert!(pool.flush(WAIT).await);

    assert_eq!(broker.connect_attempts(), 1);
    let expected: Vec<Value> = (0..100).map(|i| json!(i)).collect();
    assert_eq!(as_json(broker.published_to("t1")), expected);
}

#[tokio::test]
async fn test_schema_mismatch_never_queued() {
    let broker = Arc::new(MockBroker::new());
    let schema = Schema::parse(&json!({
        "type": "record",
        "name": "Reading",
        "fields": [{"name": "v", "type": "long"}]
    }))
    .unwrap();
    let pool = ProducerPool::builder(Arc::clone(&broker))
        .schema("readings", schema)
        .build();

    pool.produce("readings", json!({"v": "not a number"}));
    pool.produce("readings", json!({"v": 1}));
    assert!(pool.flush(WAIT).await);

    assert_eq!(broker.published_to("readings"), vec![vec![0x02]]);
    let stats = pool.stats();
    assert_eq!(stats.encode_failures, 1);
    assert_eq!(stats.sent, 1);
}

fn listener_for(
    broker: &Arc<MockBroker>,
    topics: &[&str],
    rules: &[RuleConfig],
    pool: ProducerPool<MockBroker>,
) -> InboundListener<MockBroker, MockBroker> {
    let source = ConnectionSupervisor::new(
        "source",
        Arc::clone(broker),
        vec!["mock://source".into()],
        Duration::from_secs(1),
    );
    let engine = Arc::new(RuleEngine::from_config(rules).unwrap());
    InboundListener::new(
        source,
        topics.iter().map(|t| t.to_string()).collect(),
        engine,
        pool,
    )
    .with_options(ListenerOptions {
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_listener_republishes_through_rules() {
    let broker = Arc::new(MockBroker::new());
    let pool = ProducerPool::new(Arc::clone(&broker), vec!["mock://sink".into()]);
    let rules = [RuleConfig::new("out/%topic%")
        .matching("topic", "sensors/+")
        .template(r#"{"v": {value}}"#)];
    let listener = listener_for(&broker, &["sensors/#"], &rules, pool.clone());

    let handle = listener.run().unwrap();
    assert!(wait_until(|| broker.subscriptions() == 1).await);

    broker.inject("sensors/temp", br#"{"value": 42}"#);
    broker.inject("sensors/a/b", br#"{"value": 1}"#);
    broker.inject("sensors/raw", b"garbage");

    assert!(wait_until(|| listener.stats().received == 3).await);
    assert!(pool.flush(WAIT).await);

    assert_eq!(
        as_json(broker.published_to("out/sensors/temp")),
        vec![json!({"v": 42})]
    );
    // No match for the deeper topic; the raw payload has no `value` field
    assert!(broker.published_to("out/sensors/a/b").is_empty());
    assert!(broker.published_to("out/sensors/raw").is_empty());

    let stats = handle.stats();
    assert_eq!(stats.parse_fallbacks, 1);
    assert_eq!(stats.instructions, 1);
    handle.stop().await;
}

#[tokio::test]
async fn test_listener_resubscribes_after_source_reset() {
    let broker = Arc::new(MockBroker::new());
    let pool = ProducerPool::new(Arc::clone(&broker), vec![]);
    let rules = [RuleConfig::new("copy/%topic%")];
    let listener = listener_for(&broker, &["in/#"], &rules, pool.clone());

    let handle = listener.run().unwrap();
    assert!(wait_until(|| broker.subscriptions() == 1).await);
    assert_eq!(listener.source().connect_attempts(), 1);

    // Drop the source connection; the listener reconnects on its own
    listener.source().reset();
    assert!(wait_until(|| listener.source().connect_attempts() == 2).await);
    assert!(listener.source().wait_connected(WAIT).await);

    broker.inject("in/x", br#"{"n": 1}"#);
    assert!(wait_until(|| listener.stats().received == 1).await);
    assert!(pool.flush(WAIT).await);
    assert_eq!(broker.published_to("copy/in/x").len(), 1);
    // Resubscribing did not duplicate the subscription
    assert_eq!(broker.subscriptions(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_end_to_end_avro_destination() {
    let broker = Arc::new(MockBroker::new());
    let schema = Schema::parse(&json!({
        "type": "record",
        "name": "Reading",
        "fields": [
            {"name": "value", "type": "long"},
            {"name": "topic", "type": "string"}
        ]
    }))
    .unwrap();
    let pool = ProducerPool::builder(Arc::clone(&broker))
        .schema("readings", schema)
        .build();
    let rules = [RuleConfig::new("readings").matching("topic", "sensors/+")];
    let listener = listener_for(&broker, &["sensors/+"], &rules, pool.clone());

    let handle = listener.run().unwrap();
    assert!(wait_until(|| broker.subscriptions() == 1).await);

    broker.inject("sensors/temp", br#"{"value": 42}"#);
    assert!(wait_until(|| listener.stats().instructions == 1).await);
    assert!(pool.flush(WAIT).await);

    let mut expected = vec![0x54, 0x18];
    expected.extend_from_slice(b"sensors/temp");
    assert_eq!(broker.published_to("readings"), vec![expected]);

    handle.stop().await;
}

#[tokio::test]
async fn test_sink_outage_recovers_with_backoff() {
    let broker = Arc::new(MockBroker::new());
    let pool = ProducerPool::builder(Arc::clone(&broker))
        .options(PoolOptions {
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            ..Default::default()
        })
        .build();
    pool.supervisor().connect();
    assert!(pool.supervisor().wait_connected(WAIT).await);

    broker.set_available(false);
    for i in 0..5 {
        pool.produce("t1", json!(i));
    }
    assert!(wait_until(|| pool.stats().requeued >= 1).await);

    broker.set_available(true);
    assert!(pool.flush(WAIT).await);

    let expected: Vec<Value> = (0..5).map(|i| json!(i)).collect();
    assert_eq!(as_json(broker.published_to("t1")), expected);
}
