// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker facade.
//!
//! [`Broker`] wraps exactly one publisher, chosen once from configuration,
//! and gives producers a uniform contract:
//!
//! | Call | Blocks on network | Fails |
//! |------|-------------------|-------|
//! | `publish` / `publish_event` | never | never (problems are logged) |
//! | `connect` | polling: target check | polling target missing, or after release |
//! | `disconnect` | up to the grace period | never |
//!
//! # Lifecycle
//!
//! ```text
//! new ──connect──► running ──disconnect──► released
//!  │  (buffers)                              ▲  (publish is a no-op)
//!  └─────────────────disconnect──────────────┘
//! ```
//!
//! Publishes before the first `connect()` are buffered by the publisher and
//! delivered once it starts. After `disconnect()` the publisher is released
//! and every publish is dropped with a log line.

use crate::config::BrokerConfig;
use crate::connection::ConnectionState;
use crate::error::{BrokerError, Result};
use crate::event::{Event, EventSink, QueueEntry};
use crate::metrics;
use crate::polling::PollingPublisher;
use crate::reliable::ReliablePublisher;
use crate::transport::{PollingConnector, RedisStreamConnector, ReliableConnector, SnsConnector};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The publisher behind the facade. One variant per transport kind.
pub enum Backend {
    Reliable(ReliablePublisher),
    Polling(PollingPublisher),
}

impl Backend {
    fn kind(&self) -> &'static str {
        match self {
            Self::Reliable(_) => "reliable",
            Self::Polling(_) => "polling",
        }
    }

    fn transport(&self) -> &'static str {
        match self {
            Self::Reliable(p) => p.transport(),
            Self::Polling(p) => p.transport(),
        }
    }
}

/// Transport-agnostic publishing facade.
pub struct Broker {
    backend: Backend,
    released: AtomicBool,
}

impl Broker {
    /// Build the broker selected by `config`, with the production transports.
    ///
    /// Invalid settings are a [`BrokerError::Config`]; nothing connects yet.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        config.validate()?;
        let broker = match config {
            BrokerConfig::Reliable(cfg) => {
                let connector = RedisStreamConnector::new(cfg)?;
                Self::reliable(cfg.clone(), Arc::new(connector))
            }
            BrokerConfig::Polling(cfg) => {
                let connector = SnsConnector::new(cfg.region.clone());
                Self::polling(cfg.clone(), Arc::new(connector))
            }
        };
        info!(kind = broker.kind(), transport = broker.transport(), "Broker created");
        Ok(broker)
    }

    /// Reliable broker over any connector.
    pub fn reliable(
        config: crate::config::ReliableConfig,
        connector: Arc<dyn ReliableConnector>,
    ) -> Self {
        Self::with_backend(Backend::Reliable(ReliablePublisher::new(config, connector)))
    }

    /// Polling broker over any connector.
    pub fn polling(
        config: crate::config::PollingConfig,
        connector: Arc<dyn PollingConnector>,
    ) -> Self {
        Self::with_backend(Backend::Polling(PollingPublisher::new(config, connector)))
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            released: AtomicBool::new(false),
        }
    }

    /// Transport kind: `reliable` or `polling`.
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Concrete transport name (e.g. `redis`, `sns`).
    pub fn transport(&self) -> &'static str {
        self.backend.transport()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether `disconnect()` has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Connection state of the reliable transport (`None` for polling).
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match &self.backend {
            Backend::Reliable(p) => Some(p.state()),
            Backend::Polling(_) => None,
        }
    }

    /// Messages waiting for the worker.
    pub fn queue_len(&self) -> usize {
        match &self.backend {
            Backend::Reliable(p) => p.queue_len(),
            Backend::Polling(p) => p.queue_len(),
        }
    }

    /// Start the publisher's worker. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        if self.is_released() {
            return Err(BrokerError::InvalidState {
                expected: "not released".to_string(),
                actual: "released".to_string(),
            });
        }
        match &self.backend {
            Backend::Reliable(p) => p.connect().await,
            Backend::Polling(p) => p.connect().await,
        }
    }

    /// Stop the worker and release the transport. Idempotent; safe without
    /// a prior `connect()`.
    pub async fn disconnect(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!(kind = self.kind(), "Broker already released");
            return;
        }
        match &self.backend {
            Backend::Reliable(p) => p.disconnect().await,
            Backend::Polling(p) => p.disconnect().await,
        }
        info!(kind = self.kind(), "Broker released");
    }

    /// Fire-and-forget publish of a flattened payload.
    pub fn publish(&self, payload: Map<String, Value>, routing_key: &str) {
        self.enqueue(QueueEntry::new(payload, routing_key));
    }

    /// Fire-and-forget publish of an event, routed by its routing key.
    pub fn publish_event(&self, event: &Event) {
        self.enqueue(event.to_entry());
    }

    fn enqueue(&self, entry: QueueEntry) {
        let transport = self.transport();
        if self.is_released() {
            debug!(transport, routing_key = %entry.routing_key, "Broker released, event dropped");
            metrics::record_dropped(transport, "released");
            return;
        }

        let routing_key = entry.routing_key.clone();
        let result = match &self.backend {
            Backend::Reliable(p) => p.publish(entry),
            Backend::Polling(p) => p.publish(entry),
        };

        match result {
            Ok(()) => {}
            Err(BrokerError::Shutdown) => {
                debug!(transport, routing_key = %routing_key, "Publisher stopped, event dropped");
            }
            Err(e) => {
                warn!(transport, routing_key = %routing_key, error = %e, "Event dropped");
            }
        }
    }
}

impl EventSink for Broker {
    fn publish_event(&self, event: &Event) {
        Broker::publish_event(self, event);
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("kind", &self.kind())
            .field("transport", &self.transport())
            .field("released", &self.is_released())
            .finish()
    }
}
