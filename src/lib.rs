//! # Event Relay
//!
//! Forwards lifecycle events from a host system ("series became stable",
//! "instance stored", "study deleted") to a message broker without ever
//! blocking or failing the producer.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               event-relay                                 │
//! │                                                                           │
//! │  ┌─────────────────┐   ┌────────────┐   ┌─────────────────────────────┐   │
//! │  │ EventDispatcher │──►│ Throttler  │──►│ Broker (facade)             │   │
//! │  │ (host hooks)    │   │ (per key)  │   │  ├─ ReliablePublisher       │   │
//! │  └─────────────────┘   └────────────┘   │  │   bounded queue, backoff │   │
//! │          │                              │  │   └─► Redis Streams      │   │
//! │          └─────────────────────────────►│  └─ PollingPublisher        │   │
//! │                                         │      unbounded, at-most-once│   │
//! │                                         │      └─► SNS                │   │
//! │                                         └─────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! | Transport | Queue | On failure | Guarantee |
//! |-----------|-------|------------|-----------|
//! | reliable  | bounded, drop when full | requeue at tail, reconnect with backoff | at-least-once |
//! | polling   | unbounded | drop message, re-open client | at-most-once |
//!
//! Nothing is persisted: queued messages are lost if the process dies.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_relay::{Broker, Event, EventKind, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> event_relay::Result<()> {
//!     let config = RelayConfig::from_json(
//!         r#"{ "broker": { "type": "reliable", "url": "redis://localhost:6379" } }"#,
//!     )?;
//!     let broker = Broker::from_config(&config.broker)?;
//!     broker.connect().await?;
//!
//!     // Never blocks, never fails
//!     broker.publish_event(&Event::new(EventKind::StableSeries).with_attribute("seriesID", "abc"));
//!
//!     broker.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod metrics;
pub mod polling;
pub mod reliable;
pub mod resilience;
pub mod throttle;
pub mod transport;

// Re-exports for convenience
pub use broker::{Backend, Broker};
pub use config::{BrokerConfig, EventsConfig, PollingConfig, RelayConfig, ReliableConfig, ThrottleConfig};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use dispatch::{ChangeNotification, EventDispatcher, ResourceInfo, ResourceLookup, StoredInstance};
pub use error::{BrokerError, Result};
pub use event::{Event, EventKind, EventSink, InstanceOrigin, QueueEntry, ResourceLevel};
pub use polling::PollingPublisher;
pub use reliable::ReliablePublisher;
pub use resilience::Backoff;
pub use throttle::Throttler;
