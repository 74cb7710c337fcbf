//! In-memory transports for testing.
//!
//! [`MockReliable`] and [`MockPolling`] record every publish attempt and can
//! be scripted to refuse connections or fail publishes. [`RecordingSink`]
//! captures events handed to it and [`MockLookup`] serves canned resources.
//!
//! # Example
//! ```rust,ignore
//! let mock = MockReliable::new();
//! mock.fail_next_publishes(1);
//!
//! let broker = Broker::reliable(config, mock.connector());
//! // ...
//! assert_eq!(mock.delivered_keys(), vec!["dicom.series.stable"]);
//! ```

use event_relay::transport::{
    BoxFuture, PollingClient, PollingConnector, ReliableChannel, ReliableConnector,
};
use event_relay::{BrokerError, Event, EventSink, ResourceInfo, ResourceLevel, ResourceLookup};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Consume one unit of an injected-failure budget.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A recorded publish attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishCall {
    pub target: String,
    pub routing_key: String,
    pub payload: Value,
    /// `false` when the attempt was failed by the script.
    pub delivered: bool,
}

fn delivered_keys(calls: &[PublishCall]) -> Vec<String> {
    calls
        .iter()
        .filter(|c| c.delivered)
        .map(|c| c.routing_key.clone())
        .collect()
}

// =============================================================================
// Reliable transport
// =============================================================================

#[derive(Default)]
struct ReliableScript {
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    refuse_connects: AtomicUsize,
    fail_publishes: AtomicUsize,
    hang_publishes: AtomicBool,
    reject_declare: AtomicBool,
    confirms: AtomicBool,
    calls: Mutex<Vec<PublishCall>>,
}

/// Scripted reliable connector. Clones share the script.
#[derive(Clone, Default)]
pub struct MockReliable {
    script: Arc<ReliableScript>,
}

impl MockReliable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn ReliableConnector> {
        Arc::new(self.clone())
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_next_connects(&self, n: usize) {
        self.script.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` publish attempts (recorded as undelivered).
    pub fn fail_next_publishes(&self, n: usize) {
        self.script.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Make every publish hang forever.
    pub fn hang_publishes(&self) {
        self.script.hang_publishes.store(true, Ordering::SeqCst);
    }

    pub fn reject_declare(&self, reject: bool) {
        self.script.reject_declare.store(reject, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.script.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connects.
    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }

    pub fn confirms_enabled(&self) -> bool {
        self.script.confirms.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<PublishCall> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn delivered_keys(&self) -> Vec<String> {
        delivered_keys(&self.script.calls.lock().unwrap())
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered_keys().len()
    }
}

impl ReliableConnector for MockReliable {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect(&self) -> BoxFuture<'_, Box<dyn ReliableChannel>> {
        Box::pin(async move {
            self.script.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.script.refuse_connects) {
                return Err(BrokerError::connection("mock", "connection refused"));
            }
            self.script.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockChannel {
                script: Arc::clone(&self.script),
            }) as Box<dyn ReliableChannel>)
        })
    }
}

struct MockChannel {
    script: Arc<ReliableScript>,
}

impl ReliableChannel for MockChannel {
    fn declare<'a>(&'a mut self, exchange: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.script.reject_declare.load(Ordering::SeqCst) {
                return Err(BrokerError::connection("mock", format!("{} has the wrong type", exchange)));
            }
            Ok(())
        })
    }

    fn enable_confirms(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.script.confirms.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn heartbeat(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn publish<'a>(
        &'a mut self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.script.hang_publishes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let payload: Value = serde_json::from_slice(body)?;
            let delivered = !take_one(&self.script.fail_publishes);
            self.script.calls.lock().unwrap().push(PublishCall {
                target: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload,
                delivered,
            });
            if delivered {
                Ok(())
            } else {
                Err(BrokerError::publish("mock", "injected publish failure"))
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.script.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// =============================================================================
// Polling transport
// =============================================================================

struct PollingScript {
    opens: AtomicUsize,
    target_exists: AtomicBool,
    fail_publishes: AtomicUsize,
    calls: Mutex<Vec<PublishCall>>,
}

/// Scripted polling connector. Clones share the script.
#[derive(Clone)]
pub struct MockPolling {
    script: Arc<PollingScript>,
}

impl Default for MockPolling {
    fn default() -> Self {
        Self {
            script: Arc::new(PollingScript {
                opens: AtomicUsize::new(0),
                target_exists: AtomicBool::new(true),
                fail_publishes: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl MockPolling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn PollingConnector> {
        Arc::new(self.clone())
    }

    pub fn set_target_exists(&self, exists: bool) {
        self.script.target_exists.store(exists, Ordering::SeqCst);
    }

    pub fn fail_next_publishes(&self, n: usize) {
        self.script.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Client handles opened so far.
    pub fn opens(&self) -> usize {
        self.script.opens.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<PublishCall> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn delivered_keys(&self) -> Vec<String> {
        delivered_keys(&self.script.calls.lock().unwrap())
    }
}

impl PollingConnector for MockPolling {
    fn name(&self) -> &'static str {
        "mock-polling"
    }

    fn open(&self) -> BoxFuture<'_, Box<dyn PollingClient>> {
        Box::pin(async move {
            self.script.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockPollingClient {
                script: Arc::clone(&self.script),
            }) as Box<dyn PollingClient>)
        })
    }
}

struct MockPollingClient {
    script: Arc<PollingScript>,
}

impl PollingClient for MockPollingClient {
    fn check_target<'a>(&'a self, target: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.script.target_exists.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BrokerError::connection("mock-polling", format!("topic {} not found", target)))
            }
        })
    }

    fn publish<'a>(
        &'a self,
        target: &'a str,
        routing_key: &'a str,
        body: String,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let payload: Value = serde_json::from_str(&body)?;
            let delivered = !take_one(&self.script.fail_publishes);
            let mut calls = self.script.calls.lock().unwrap();
            calls.push(PublishCall {
                target: target.to_string(),
                routing_key: routing_key.to_string(),
                payload,
                delivered,
            });
            if delivered {
                Ok(format!("msg-{}", calls.len()))
            } else {
                Err(BrokerError::publish("mock-polling", "injected publish failure"))
            }
        })
    }
}

// =============================================================================
// Event sink and resource lookup
// =============================================================================

/// Records every event with the (tokio) time it arrived.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Instant, Event)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn timed(&self) -> Vec<(Instant, Event)> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl EventSink for RecordingSink {
    fn publish_event(&self, event: &Event) {
        self.events.lock().unwrap().push((Instant::now(), event.clone()));
    }
}

/// Canned host resources.
#[derive(Default)]
pub struct MockLookup {
    patients: Vec<String>,
    resources: HashMap<(ResourceLevel, String), ResourceInfo>,
    failing: AtomicBool,
}

impl MockLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patients(mut self, ids: &[&str]) -> Self {
        self.patients = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_resource(mut self, level: ResourceLevel, info: ResourceInfo) -> Self {
        self.resources.insert((level, info.id.clone()), info);
        self
    }

    /// Make every lookup fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ResourceLookup for MockLookup {
    fn stored_patients(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BrokerError::Lookup {
                    resource: "patients".to_string(),
                    message: "host unavailable".to_string(),
                });
            }
            Ok(self.patients.clone())
        })
    }

    fn resource<'a>(&'a self, level: ResourceLevel, id: &'a str) -> BoxFuture<'a, ResourceInfo> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BrokerError::Lookup {
                    resource: format!("{}/{}", level.as_str(), id),
                    message: "host unavailable".to_string(),
                });
            }
            self.resources
                .get(&(level, id.to_string()))
                .cloned()
                .ok_or_else(|| BrokerError::Lookup {
                    resource: format!("{}/{}", level.as_str(), id),
                    message: "not found".to_string(),
                })
        })
    }
}
