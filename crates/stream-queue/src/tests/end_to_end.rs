//! V. Producer to Consumer tests.
//!
//! Rules covered:
//! - 21. Send, subscribe and a new-entry read return the sent message; a
//!   history read returns it only after it was delivered to this consumer
//! - 22. A committed entry is not read again
//! - 23. Producers and consumers from one registry share one connection
//! - 24. Non-record payloads are rejected by the producer

use super::harness::{fast_options, Order, TestBroker};
use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::consumer::StreamConsumer;
use crate::error::{BrokerError, CodecError};
use crate::identity::Fixed;
use crate::memory::{MemoryBroker, MemoryConnector};
use crate::producer::StreamProducer;
use crate::registry::ConnectionRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rule 21: Round trip through the broker
///
/// History is this consumer's pending list, not a replay of the log, so a
/// history read straight after subscribing is empty until the entry has been
/// delivered once.
#[tokio::test]
async fn rule_21_send_then_read_then_history() {
    let harness = TestBroker::new();
    let producer = StreamProducer::new(harness.manager.clone());
    let order = Order {
        note: Some("leave at the door".to_string()),
        ..Order::sample(3)
    };

    assert!(producer.send("orders", &order).await.unwrap());

    let consumer = harness.consumer("billing", "worker-1");
    assert!(consumer.subscribe("orders").await.unwrap());

    assert!(
        consumer.consume(None, false).await.unwrap().is_none(),
        "Nothing has been delivered to this consumer yet"
    );

    let delivered = consumer.consume(None, true).await.unwrap().unwrap();
    let history = consumer.consume(None, false).await.unwrap().unwrap();

    assert_eq!(delivered, history);
    assert_eq!(history.len(), 1);
    assert!(!history[0].id.is_empty());
    assert_eq!(history[0].message, order);
}

/// Rule 22: Commit removes the entry from every later read
#[tokio::test]
async fn rule_22_committed_entry_is_not_returned_again() {
    let harness = TestBroker::new();
    let producer = StreamProducer::new(harness.manager.clone());
    let consumer = harness.consumer("billing", "worker-1");
    assert!(consumer.subscribe("orders").await.unwrap());

    producer.send("orders", &Order::sample(1)).await.unwrap();
    let message = consumer.consume_single(true).await.unwrap().unwrap();
    assert!(consumer.commit(&message.id).await.unwrap());

    producer.send("orders", &Order::sample(2)).await.unwrap();
    let next = consumer.consume(None, true).await.unwrap().unwrap();

    assert_eq!(next.len(), 1);
    assert_ne!(next[0].id, message.id);
    assert_eq!(next[0].message, Order::sample(2));
    assert!(harness
        .broker
        .pending_ids("orders", "billing")
        .iter()
        .all(|id| id != &message.id));
}

/// Rule 23: One named connection, one session
#[tokio::test]
async fn rule_23_registry_shares_connection() {
    let registry = ConnectionRegistry::new();
    let connector = Arc::new(MemoryConnector::new(MemoryBroker::new()));
    let config = BrokerConfig {
        name: "orders".to_string(),
        ..Default::default()
    };

    let producer_conn = registry
        .get_or_create_with(&config, connector.clone())
        .unwrap();
    let consumer_conn = registry.get_or_create_with(&config, connector.clone()).unwrap();

    let producer = StreamProducer::new(producer_conn);
    let consumer: StreamConsumer<Order> =
        StreamConsumer::with_naming(consumer_conn, "billing", &Fixed("worker-1".to_string()));

    producer.send("orders", &Order::sample(1)).await.unwrap();
    assert!(consumer.subscribe("orders").await.unwrap());
    assert!(consumer.consume_single(true).await.unwrap().is_some());

    assert_eq!(connector.connect_calls(), 1);
    registry.close_all().await;
}

/// Rule 24: Only records can become field lists
#[tokio::test]
async fn rule_24_non_record_payload_is_an_error() {
    let harness = TestBroker::new();
    let producer = StreamProducer::new(harness.manager.clone());

    let err = producer.send("orders", &42u32).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Codec(CodecError::NotARecord(_))
    ));
    assert_eq!(harness.broker.stream_len("orders"), 0);
}

/// Producer errors propagate instead of returning false
#[tokio::test]
async fn send_propagates_connection_unavailable() {
    let connector = Arc::new(MemoryConnector::new(MemoryBroker::new()));
    connector.fail_next_connects(10);
    let manager = Arc::new(ConnectionManager::new("down", fast_options(), connector));
    let producer = StreamProducer::new(manager);

    assert!(matches!(
        producer.send("orders", &Order::sample(1)).await,
        Err(BrokerError::ConnectionUnavailable { .. })
    ));
}

/// Untyped records round-trip as string maps
#[tokio::test]
async fn string_map_messages() {
    let harness = TestBroker::new();
    let producer = StreamProducer::new(harness.manager.clone());
    let record: BTreeMap<String, String> = [
        ("event".to_string(), "shipped".to_string()),
        ("carrier".to_string(), "dhl".to_string()),
    ]
    .into_iter()
    .collect();

    producer.send("events", &record).await.unwrap();

    let consumer: StreamConsumer<BTreeMap<String, String>> = StreamConsumer::with_naming(
        harness.manager.clone(),
        "audit",
        &Fixed("auditor".to_string()),
    );
    assert!(consumer.subscribe("events").await.unwrap());

    let message = consumer.consume_single(true).await.unwrap().unwrap();
    assert_eq!(message.message, record);
}
