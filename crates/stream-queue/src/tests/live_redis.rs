//! VII. Tests against a real Redis server.
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use super::harness::Order;
use crate::config::ConnectionOptions;
use crate::connection::ConnectionManager;
use crate::consumer::StreamConsumer;
use crate::identity::Fixed;
use crate::producer::StreamProducer;
use std::sync::Arc;

fn live_manager() -> Arc<ConnectionManager> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let mut options = ConnectionOptions::parse(&url).unwrap();
    options.client_name = "stream-queue-tests".to_string();
    Arc::new(ConnectionManager::redis("live", options))
}

fn unique_stream() -> String {
    format!("stream-queue-test-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn live_send_consume_commit() {
    let manager = live_manager();
    let stream = unique_stream();
    let producer = StreamProducer::new(manager.clone());
    let consumer: StreamConsumer<Order> =
        StreamConsumer::with_naming(manager.clone(), "billing", &Fixed("live-1".to_string()));

    assert!(producer.send(&stream, &Order::sample(1)).await.unwrap());
    assert!(consumer.subscribe(&stream).await.unwrap());
    assert!(consumer.subscribe(&stream).await.unwrap());

    let message = consumer.consume_single(true).await.unwrap().unwrap();
    assert_eq!(message.message, Order::sample(1));
    assert_eq!(consumer.pending_count().await.unwrap(), 1);

    let history = consumer.consume(None, false).await.unwrap().unwrap();
    assert_eq!(history[0].id, message.id);

    assert!(consumer.commit(&message.id).await.unwrap());
    assert!(!consumer.commit(&message.id).await.unwrap());
    assert!(consumer.consume(None, true).await.unwrap().is_none());

    manager.close().await;
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn live_empty_stream_reads_none() {
    let manager = live_manager();
    let consumer: StreamConsumer<Order> =
        StreamConsumer::with_naming(manager.clone(), "billing", &Fixed("live-2".to_string()));

    assert!(consumer.subscribe(&unique_stream()).await.unwrap());
    assert!(consumer.consume(None, true).await.unwrap().is_none());

    manager.close().await;
}
