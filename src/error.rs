// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the event relay.
//!
//! Internal layers (transports, publishers, throttler) return typed errors.
//! Only the outer boundary ([`Broker`](crate::broker::Broker) and
//! [`EventDispatcher`](crate::dispatch::EventDispatcher)) turns them into
//! log lines, so producers never observe a failure.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Unsupported transport kind, missing required field |
//! | `Connection` | Yes | Broker unreachable, declare failed, keepalive failed |
//! | `Publish` | Yes | Broker rejected the message or did not confirm it |
//! | `Serialization` | No | Payload could not be encoded (message dropped) |
//! | `Backpressure` | No | Bounded queue full (message dropped) |
//! | `InvalidState` | No | Lifecycle call in the wrong state |
//! | `Shutdown` | No | Publisher is stopping |
//! | `Lookup` | No | Host resource lookup failed |
//!
//! # Retry Behavior
//!
//! The reliable transport retries [`BrokerError::is_retryable()`] errors with
//! capped exponential backoff. The polling transport never retries a message.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while forwarding events.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Invalid or missing configuration.
    ///
    /// Raised at construction only. Fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cannot reach the broker or set up the channel.
    #[error("Connection error ({transport}): {message}")]
    Connection { transport: String, message: String },

    /// The broker rejected a message or failed to acknowledge it.
    #[error("Publish error ({transport}): {message}")]
    Publish { transport: String, message: String },

    /// Payload could not be encoded to JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bounded publish queue is full.
    #[error("Publish queue full ({capacity} entries), message dropped")]
    Backpressure { capacity: usize },

    /// Lifecycle violation (e.g. connecting a publisher that was stopped).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// The host resource lookup failed.
    #[error("Resource lookup error ({resource}): {message}")]
    Lookup { resource: String, message: String },
}

impl BrokerError {
    /// Create a connection error for the named transport.
    pub fn connection(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Create a publish error for the named transport.
    pub fn publish(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Publish { .. } => true,
            Self::Config(_) => false,
            Self::Serialization(_) => false, // Same payload fails the same way
            Self::Backpressure { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Lookup { .. } => false,
        }
    }
}
