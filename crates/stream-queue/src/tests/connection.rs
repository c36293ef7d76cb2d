//! I. Connection Sharing & Recovery tests.
//!
//! Rules covered:
//! - 1. Concurrent first requests run exactly one connect sequence
//! - 2. All concurrent callers receive the same session
//! - 3. A dropped session triggers exactly one reconnect
//! - 4. Failed connects are not cached
//! - 5. Retries inside one connect sequence
//! - 6. Close is terminal

use super::harness::TestBroker;
use crate::connection::ConnectionState;
use crate::error::BrokerError;
use crate::memory::{MemoryBroker, MemoryConnector};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;

/// Rules 1-2: N parallel callers, one connect, one session
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rule_01_concurrent_callers_share_one_connect() {
    let harness = TestBroker::with_connector(
        MemoryConnector::new(MemoryBroker::new()).with_connect_delay(Duration::from_millis(50)),
    );

    let tasks = (0..16).map(|_| {
        let manager = harness.manager.clone();
        tokio::spawn(async move { manager.database().await.map(|s| s.id()) })
    });

    let ids: HashSet<u64> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(ids.len(), 1, "All callers should share one session");
    assert_eq!(harness.connector.connect_calls(), 1);
    assert_eq!(harness.manager.connect_count(), 1);
    assert_eq!(harness.manager.state(), ConnectionState::Connected);
}

/// Rule 3: Forced disconnect, next request reconnects once
#[tokio::test]
async fn rule_03_reconnects_after_connection_loss() {
    let harness = TestBroker::new();

    let first = harness.manager.database().await.unwrap();
    harness.connector.drop_connections();
    assert!(!first.is_connected());
    assert!(!harness.manager.is_connected());

    let second = harness.manager.database().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(harness.connector.connect_calls(), 2);

    let fields = vec![("sku".to_string(), "A-1".to_string())];
    let id = second.append("orders", &fields).await.unwrap();
    assert!(id.is_some(), "Reconnected session should accept commands");
}

/// Rule 3: Concurrent callers observing a dead session reconnect once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rule_03_concurrent_reconnect_runs_once() {
    let harness = TestBroker::with_connector(
        MemoryConnector::new(MemoryBroker::new()).with_connect_delay(Duration::from_millis(30)),
    );
    harness.manager.database().await.unwrap();
    harness.connector.drop_connections();

    let tasks = (0..8).map(|_| {
        let manager = harness.manager.clone();
        tokio::spawn(async move { manager.database().await.map(|s| s.id()) })
    });

    let ids: HashSet<u64> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(ids.len(), 1);
    assert_eq!(harness.connector.connect_calls(), 2);
    assert_eq!(harness.manager.connect_count(), 2);
}

/// Rule 4: An exhausted connect sequence is retried from scratch next time
#[tokio::test]
async fn rule_04_failure_is_not_cached() {
    let harness = TestBroker::new();
    harness.connector.fail_next_connects(3);

    let Err(err) = harness.manager.database().await else {
        panic!("connect sequence should be exhausted");
    };
    assert!(
        matches!(err, BrokerError::ConnectionUnavailable { attempts: 3, .. }),
        "Expected ConnectionUnavailable, got {:?}",
        err
    );
    assert_eq!(harness.manager.state(), ConnectionState::Disconnected);

    let session = harness.manager.database().await.unwrap();
    assert!(session.is_connected());
    assert_eq!(harness.manager.connect_count(), 2);
    assert_eq!(harness.manager.state(), ConnectionState::Connected);
}

/// Rule 5: Transient refusals inside one sequence are retried with backoff
#[tokio::test]
async fn rule_05_retries_within_one_sequence() {
    let harness = TestBroker::new();
    harness.connector.fail_next_connects(2);

    harness.manager.database().await.unwrap();

    assert_eq!(harness.connector.connect_calls(), 3);
    assert_eq!(harness.manager.connect_count(), 1);
}

/// Rule 6: Requests after close fail with Closed
#[tokio::test]
async fn rule_06_close_is_terminal() {
    let harness = TestBroker::new();
    let session = harness.manager.database().await.unwrap();

    harness.manager.close().await;

    assert!(!session.is_connected());
    assert_eq!(harness.manager.state(), ConnectionState::Closed);
    assert!(matches!(
        harness.manager.database().await,
        Err(BrokerError::Closed(_))
    ));
    assert_eq!(harness.connector.connect_calls(), 1);
}
