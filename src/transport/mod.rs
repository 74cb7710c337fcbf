// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seams driven by the publishers.
//!
//! The publishers own all queueing, retry and lifecycle logic; a transport
//! only knows how to open a connection and move one message. Two shapes:
//!
//! - [`ReliableConnector`] / [`ReliableChannel`]: a stateful connection with
//!   an exchange to declare, a keepalive to pump and optional confirmations.
//!   Implemented over Redis Streams in [`redis_streams`].
//! - [`PollingConnector`] / [`PollingClient`]: a stateless request/response
//!   client. Implemented over SNS in [`sns`].
//!
//! Tests plug in-memory implementations into the same traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use event_relay::transport::{BoxFuture, ReliableChannel, ReliableConnector};
//!
//! struct Discard;
//!
//! impl ReliableChannel for Discard {
//!     fn declare<'a>(&'a mut self, _exchange: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn enable_confirms(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn heartbeat(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn publish<'a>(&'a mut self, _x: &'a str, _rk: &'a str, _body: &'a [u8]) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn close(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

pub mod redis_streams;
pub mod sns;

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

pub use redis_streams::{RedisStreamChannel, RedisStreamConnector};
pub use sns::{SnsClient, SnsConnector};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Opens connections for the reliable publisher.
pub trait ReliableConnector: Send + Sync + 'static {
    /// Short transport name for logs, metrics and errors.
    fn name(&self) -> &'static str;

    /// Open a fresh connection. Fails with `BrokerError::Connection`.
    fn connect(&self) -> BoxFuture<'_, Box<dyn ReliableChannel>>;
}

/// One open connection of the reliable transport.
///
/// Owned by the publisher's worker; never shared.
pub trait ReliableChannel: Send {
    /// Make sure the target exchange exists (or can be created).
    fn declare<'a>(&'a mut self, exchange: &'a str) -> BoxFuture<'a, ()>;

    /// Require broker acknowledgement for every subsequent publish.
    fn enable_confirms(&mut self) -> BoxFuture<'_, ()>;

    /// Keepalive processing. Must return promptly when nothing is due.
    fn heartbeat(&mut self) -> BoxFuture<'_, ()>;

    /// Publish one serialized payload. With confirms enabled, a missing
    /// acknowledgement is a `BrokerError::Publish`.
    fn publish<'a>(
        &'a mut self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
    ) -> BoxFuture<'a, ()>;

    /// Tear the connection down. Errors here are informational.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens clients for the polling publisher.
pub trait PollingConnector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Open (and authenticate) a client handle.
    fn open(&self) -> BoxFuture<'_, Box<dyn PollingClient>>;
}

/// Stateless request/response client of the polling transport.
pub trait PollingClient: Send + Sync {
    /// Lightweight existence check of the publish target.
    fn check_target<'a>(&'a self, target: &'a str) -> BoxFuture<'a, ()>;

    /// Publish one message, returning the broker-assigned message id.
    fn publish<'a>(
        &'a self,
        target: &'a str,
        routing_key: &'a str,
        body: String,
    ) -> BoxFuture<'a, String>;
}
