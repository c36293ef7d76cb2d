//! IV. Acknowledgement tests.
//!
//! Rules covered:
//! - 18. Committing a pending entry returns true exactly once
//! - 19. Committing an unknown id returns false without raising
//! - 20. Uncommitted entries remain in the consumer's history

use super::harness::{Order, TestBroker};
use crate::producer::StreamProducer;

/// Rule 18: A second commit of the same id reports nothing acknowledged
#[tokio::test]
async fn rule_18_commit_once() {
    let harness = TestBroker::new();
    let producer = StreamProducer::new(harness.manager.clone());
    producer.send("orders", &Order::sample(1)).await.unwrap();

    let consumer = harness.consumer("billing", "worker-1");
    assert!(consumer.subscribe("orders").await.unwrap());
    let message = consumer.consume_single(true).await.unwrap().unwrap();
    assert_eq!(consumer.pending_count().await.unwrap(), 1);

    assert!(consumer.commit(&message.id).await.unwrap());
    assert!(!consumer.commit(&message.id).await.unwrap());
    assert_eq!(consumer.pending_count().await.unwrap(), 0);
}

/// Rule 19: Unknown and malformed ids
#[tokio::test]
async fn rule_19_unknown_id_returns_false() {
    let harness = TestBroker::new();
    let consumer = harness.consumer("billing", "worker-1");
    assert!(consumer.subscribe("orders").await.unwrap());

    assert!(!consumer.commit("9999999999999-0").await.unwrap());
    assert!(!consumer.commit("not-an-id").await.unwrap());
}

/// Rule 20: History reads return delivered, uncommitted entries only
#[tokio::test]
async fn rule_20_history_holds_uncommitted_entries() {
    let harness = TestBroker::new();
    let producer = StreamProducer::new(harness.manager.clone());
    for n in 1..=3 {
        producer.send("orders", &Order::sample(n)).await.unwrap();
    }

    let consumer = harness.consumer("billing", "worker-1");
    assert!(consumer.subscribe("orders").await.unwrap());
    let delivered = consumer.consume(None, true).await.unwrap().unwrap();
    assert_eq!(delivered.len(), 3);

    assert!(consumer.commit(&delivered[1].id).await.unwrap());

    let history = consumer.consume(None, false).await.unwrap().unwrap();
    assert_eq!(
        history.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec![delivered[0].id.as_str(), delivered[2].id.as_str()]
    );

    let other = harness.consumer("billing", "worker-2");
    assert!(other.subscribe("orders").await.unwrap());
    assert!(
        other.consume(None, false).await.unwrap().is_none(),
        "History is per consumer"
    );
}
