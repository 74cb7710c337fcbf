// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate broker failures and verify graceful degradation.
//!
//! These tests drive both publishers against scripted in-memory transports
//! under a paused clock and verify that producers never block, failed
//! messages are requeued (reliable) or dropped (polling), and shutdown
//! always completes.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, MockPolling, MockReliable};
use event_relay::{
    Broker, BrokerError, ConnectionState, Event, PollingConfig, QueueEntry, ReliableConfig,
    ReliablePublisher,
};
use serde_json::{json, Map};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn reliable_config() -> ReliableConfig {
    ReliableConfig::for_testing("redis://mock:6379")
}

fn polling_config() -> PollingConfig {
    PollingConfig::for_testing("arn:aws:sns:us-east-1:000000000000:events")
}

fn entry(routing_key: &str) -> QueueEntry {
    let mut payload = Map::new();
    payload.insert("identity".to_string(), json!(routing_key));
    QueueEntry::new(payload, routing_key)
}

fn keys(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("evt.{}", i)).collect()
}

// =============================================================================
// Reliable: buffering and backpressure
// =============================================================================

/// Test: events published before connect are delivered in order once started
#[tokio::test(start_paused = true)]
async fn buffered_events_delivered_in_order_after_connect() {
    let mock = MockReliable::new();
    let broker = Broker::reliable(reliable_config(), mock.connector());

    for i in 0..5 {
        broker.publish_event(&Event::custom(format!("evt.{}", i)));
    }
    assert_eq!(broker.queue_len(), 5);
    assert_eq!(mock.connect_attempts(), 0);

    broker.connect().await.unwrap();
    eventually("buffered delivery", || mock.delivered_count() == 5).await;

    assert_eq!(mock.delivered_keys(), keys(0..5));
    assert_eq!(broker.queue_len(), 0);
    broker.disconnect().await;
}

/// Test: a full queue drops the newest events and never blocks the producer
#[tokio::test(start_paused = true)]
async fn full_queue_drops_without_blocking() {
    let mock = MockReliable::new();
    let config = ReliableConfig {
        queue_capacity: 3,
        ..reliable_config()
    };
    let broker = Broker::reliable(config, mock.connector());

    let start = Instant::now();
    for i in 0..5 {
        broker.publish_event(&Event::custom(format!("evt.{}", i)));
    }
    assert_eq!(start.elapsed(), Duration::ZERO, "publish must not wait");
    assert_eq!(broker.queue_len(), 3);

    broker.connect().await.unwrap();
    eventually("delivery of the kept events", || mock.delivered_count() == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(mock.delivered_keys(), keys(0..3));
    broker.disconnect().await;
}

/// Test: the publisher reports Backpressure directly when full
#[tokio::test]
async fn publisher_reports_backpressure() {
    let config = ReliableConfig {
        queue_capacity: 1,
        ..reliable_config()
    };
    let publisher = ReliablePublisher::new(config, MockReliable::new().connector());

    publisher.publish(entry("a")).unwrap();
    match publisher.publish(entry("b")) {
        Err(BrokerError::Backpressure { capacity }) => assert_eq!(capacity, 1),
        other => panic!("expected Backpressure, got {:?}", other),
    }
}

// =============================================================================
// Reliable: failures and reconnection
// =============================================================================

/// Test: a failed publish is requeued at the tail and delivered after reconnect
#[tokio::test(start_paused = true)]
async fn failed_publish_requeued_and_redelivered() {
    let mock = MockReliable::new();
    mock.fail_next_publishes(1);
    let publisher = ReliablePublisher::new(reliable_config(), mock.connector());

    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut states = publisher.state_receiver();
    let recorder = {
        let observed = Arc::clone(&observed);
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                observed.lock().unwrap().push(state);
            }
        })
    };

    publisher.publish(entry("first")).unwrap();
    publisher.publish(entry("second")).unwrap();

    let start = Instant::now();
    publisher.connect().await.unwrap();
    eventually("redelivery", || mock.delivered_count() == 2).await;

    // The failed message went behind the one queued after it
    assert_eq!(mock.delivered_keys(), vec!["second", "first"]);
    let attempts = mock.attempts();
    assert_eq!(attempts[0].routing_key, "first");
    assert!(!attempts[0].delivered);

    // One reconnect, after at least the backoff floor
    assert_eq!(mock.connects(), 2);
    assert!(mock.closes() >= 1);
    assert!(start.elapsed() >= reliable_config().min_backoff());
    assert!(observed.lock().unwrap().contains(&ConnectionState::Disconnected));
    assert_eq!(publisher.state(), ConnectionState::Connected);

    publisher.disconnect().await;
    assert_eq!(publisher.state(), ConnectionState::Disconnected);
    recorder.await.unwrap();
}

/// Test: refused connects back off exponentially, then deliver
#[tokio::test(start_paused = true)]
async fn refused_connects_back_off_then_deliver() {
    let mock = MockReliable::new();
    mock.refuse_next_connects(3);
    let broker = Broker::reliable(reliable_config(), mock.connector());
    broker.publish_event(&Event::custom("evt.0"));

    let start = Instant::now();
    broker.connect().await.unwrap();
    eventually("delivery after retries", || mock.delivered_count() == 1).await;

    assert_eq!(mock.connect_attempts(), 4);
    assert_eq!(mock.connects(), 1);
    // 1s + 2s + 4s, each plus jitter
    assert!(start.elapsed() >= Duration::from_secs(7));
    broker.disconnect().await;
}

/// Test: a rejected declare closes the connection and is retried
#[tokio::test(start_paused = true)]
async fn rejected_declare_retries() {
    let mock = MockReliable::new();
    mock.reject_declare(true);
    let broker = Broker::reliable(reliable_config(), mock.connector());
    broker.publish_event(&Event::custom("evt.0"));
    broker.connect().await.unwrap();

    eventually("second connect attempt", || mock.connect_attempts() >= 2).await;
    assert!(mock.closes() >= 2);
    assert_eq!(mock.delivered_count(), 0);
    assert_eq!(broker.queue_len(), 1);

    mock.reject_declare(false);
    eventually("delivery once declare succeeds", || mock.delivered_count() == 1).await;
    broker.disconnect().await;
}

/// Test: confirm_delivery turns on confirmations on every connection
#[tokio::test(start_paused = true)]
async fn confirm_delivery_enables_confirms() {
    let mock = MockReliable::new();
    let config = ReliableConfig {
        confirm_delivery: true,
        ..reliable_config()
    };
    let broker = Broker::reliable(config, mock.connector());
    broker.connect().await.unwrap();

    eventually("confirms enabled", || mock.confirms_enabled()).await;
    broker.disconnect().await;
}

// =============================================================================
// Reliable: shutdown
// =============================================================================

/// Test: a worker stuck in publish is abandoned after the grace period
#[tokio::test(start_paused = true)]
async fn disconnect_abandons_hung_worker_after_grace() {
    let mock = MockReliable::new();
    mock.hang_publishes();
    let broker = Broker::reliable(reliable_config(), mock.connector());
    broker.publish_event(&Event::custom("evt.0"));
    broker.connect().await.unwrap();

    eventually("connection", || mock.connects() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    broker.disconnect().await;
    let elapsed = start.elapsed();

    let grace = reliable_config().shutdown_grace();
    assert!(elapsed >= grace, "returned before grace: {:?}", elapsed);
    assert!(elapsed < grace + Duration::from_secs(1), "overran grace: {:?}", elapsed);
    assert!(broker.is_released());
}

/// Test: disconnect is idempotent and safe without connect
#[tokio::test]
async fn disconnect_without_connect_is_safe() {
    let mock = MockReliable::new();
    let broker = Broker::reliable(reliable_config(), mock.connector());
    broker.publish_event(&Event::custom("evt.0"));

    broker.disconnect().await;
    broker.disconnect().await;

    // Publish after release is a silent no-op
    broker.publish_event(&Event::custom("evt.1"));
    assert_eq!(broker.queue_len(), 0);
    assert_eq!(mock.connect_attempts(), 0);
    assert!(broker.connect().await.is_err());
}

/// Test: a running publisher stops promptly while backing off
#[tokio::test(start_paused = true)]
async fn disconnect_interrupts_backoff() {
    let mock = MockReliable::new();
    mock.refuse_next_connects(usize::MAX);
    let config = ReliableConfig {
        min_backoff_secs: 30.0,
        ..reliable_config()
    };
    let broker = Broker::reliable(config, mock.connector());
    broker.connect().await.unwrap();
    eventually("first attempt", || mock.connect_attempts() == 1).await;

    let start = Instant::now();
    broker.disconnect().await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(broker.connection_state(), Some(ConnectionState::Disconnected));
}

// =============================================================================
// Polling
// =============================================================================

/// Test: a failed publish drops the message and re-opens the client
#[tokio::test(start_paused = true)]
async fn polling_failure_drops_message_and_reopens_client() {
    let mock = MockPolling::new();
    mock.fail_next_publishes(1);
    let broker = Broker::polling(polling_config(), mock.connector());

    broker.publish_event(&Event::custom("evt.0"));
    broker.publish_event(&Event::custom("evt.1"));
    broker.connect().await.unwrap();

    eventually("second message", || mock.delivered_keys().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // At-most-once: the failed message is never retried
    assert_eq!(mock.delivered_keys(), vec!["evt.1"]);
    let attempts = mock.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].delivered);
    assert_eq!(attempts[1].target, polling_config().target);
    assert_eq!(mock.opens(), 2);
    broker.disconnect().await;
}

/// Test: connect surfaces a missing target and can be retried
#[tokio::test(start_paused = true)]
async fn polling_connect_fails_when_target_missing() {
    let mock = MockPolling::new();
    mock.set_target_exists(false);
    let broker = Broker::polling(polling_config(), mock.connector());
    broker.publish_event(&Event::custom("evt.0"));

    match broker.connect().await {
        Err(BrokerError::Connection { message, .. }) => {
            assert!(message.contains(&polling_config().target))
        }
        other => panic!("expected Connection error, got {:?}", other),
    }
    assert_eq!(broker.queue_len(), 1);

    mock.set_target_exists(true);
    broker.connect().await.unwrap();
    eventually("delivery", || mock.delivered_keys() == vec!["evt.0"]).await;
    broker.disconnect().await;
}

/// Test: disconnect discards undelivered polling messages
#[tokio::test(start_paused = true)]
async fn polling_disconnect_drops_queue() {
    let mock = MockPolling::new();
    let broker = Broker::polling(polling_config(), mock.connector());
    for i in 0..3 {
        broker.publish_event(&Event::custom(format!("evt.{}", i)));
    }
    broker.disconnect().await;

    assert_eq!(broker.queue_len(), 0);
    assert_eq!(mock.opens(), 0);
}
